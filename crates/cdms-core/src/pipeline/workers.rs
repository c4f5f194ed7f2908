//! Analyzer and aggregator threads
//!
//! Both exit on their own once their input channel disconnects, after
//! draining whatever was already queued.

use crate::analysis::analyzer::{AnalyzerConfig, SpectralAnalyzer};
use crate::analysis::event::EventResult;
use crate::pipeline::status::{StatusEvent, StatusSink};
use crate::source::Block;
use crate::stats::aggregator::{self, SharedAggregator};
use crossbeam_channel::{select, tick, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Spawn the analyzer: one block in, one result out, in order
///
/// `alive` is held until the thread exits, including on panic, so the
/// source can tell when nothing consumes its blocks any more.
pub fn spawn_analyzer(
    blocks: Receiver<Block>,
    results: Sender<EventResult>,
    status: StatusSink,
    config: AnalyzerConfig,
    alive: Sender<()>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cdms-analyzer".into())
        .spawn(move || {
            let _alive = alive;
            let mut analyzer = SpectralAnalyzer::new(config);
            let mut analyzed = 0u64;

            for block in blocks.iter() {
                let started = Instant::now();
                match analyzer.analyze(&block) {
                    Ok(result) => {
                        analyzed += 1;
                        tracing::debug!(
                            sequence = result.sequence,
                            class = %result.class,
                            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                            "Block analyzed"
                        );
                        if results.send(result).is_err() {
                            break;
                        }
                    }
                    Err(e) => status.emit(StatusEvent::MalformedBlock {
                        sequence: block.sequence,
                        reason: e.to_string(),
                    }),
                }
            }

            tracing::debug!(analyzed, "Analyzer thread exiting");
        })
}

/// Spawn the aggregator: records results and ticks the rate every `rate_tick`
pub fn spawn_aggregator(
    results: Receiver<EventResult>,
    shared: SharedAggregator,
    rate_tick: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cdms-aggregator".into())
        .spawn(move || {
            aggregator::lock(&shared).restart_rate_window(Instant::now());
            let ticker = tick(rate_tick);

            loop {
                select! {
                    recv(results) -> msg => match msg {
                        Ok(result) => aggregator::lock(&shared).record(&result),
                        Err(_) => break,
                    },
                    recv(ticker) -> at => {
                        if let Ok(at) = at {
                            let rate = aggregator::lock(&shared).tick_rate(at);
                            tracing::trace!(rate, "Rate tick");
                        }
                    }
                }
            }

            tracing::debug!("Aggregator thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::event::EventClass;
    use crate::source::config::SourceKind;
    use crate::source::{BackpressurePolicy, BlockSink, SourceContext};
    use crate::stats::aggregator::EventAggregator;
    use chrono::Utc;
    use crossbeam_channel::{bounded, TryRecvError};

    fn block(sequence: u64, samples: Vec<i16>) -> Block {
        Block {
            samples,
            fs_hz: 2_400_000.0,
            captured_at: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_analyzer_skips_malformed_blocks() {
        let (block_tx, block_rx) = bounded(4);
        let (result_tx, result_rx) = bounded(4);
        let (status, status_rx) = StatusSink::channel();

        let (alive_tx, alive_rx) = bounded::<()>(0);

        let handle =
            spawn_analyzer(block_rx, result_tx, status, AnalyzerConfig::default(), alive_tx)
                .unwrap();
        block_tx.send(block(0, vec![0; 1024])).unwrap();
        block_tx.send(block(1, vec![0; 1])).unwrap();
        block_tx.send(block(2, vec![0; 1024])).unwrap();
        drop(block_tx);
        handle.join().unwrap();

        let seqs: Vec<u64> = result_rx.try_iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert!(status_rx
            .try_iter()
            .any(|e| matches!(e, StatusEvent::MalformedBlock { sequence: 1, .. })));
        // The liveness sender went with the thread
        assert!(matches!(alive_rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_source_notices_analyzer_exit() {
        let (alive_tx, alive_rx) = bounded::<()>(0);
        let (sink, block_rx) = BlockSink::channel(4, BackpressurePolicy::DropOldest);
        let sink = sink.watch_consumer(alive_rx);
        let (result_tx, result_rx) = bounded(4);
        let (status, status_rx) = StatusSink::channel();
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        let mut ctx =
            SourceContext::new(SourceKind::Synthetic, sink, stop_rx, status.clone(), None);

        let handle =
            spawn_analyzer(block_rx, result_tx, status, AnalyzerConfig::default(), alive_tx)
                .unwrap();
        // Nobody reads results, so the analyzer exits after its first block
        drop(result_rx);
        assert!(ctx.emit(vec![0; 1024], 2_400_000.0));
        handle.join().unwrap();

        assert!(!ctx.emit(vec![0; 1024], 2_400_000.0));
        assert_eq!(ctx.produced(), 1);
        assert!(status_rx
            .try_iter()
            .any(|e| matches!(e, StatusEvent::SourceFailed { .. })));
    }

    #[test]
    fn test_aggregator_records_and_exits_on_disconnect() {
        let (result_tx, result_rx) = bounded(4);
        let shared = EventAggregator::shared();
        let handle =
            spawn_aggregator(result_rx, shared.clone(), Duration::from_millis(20)).unwrap();

        for sequence in 0..3 {
            result_tx
                .send(EventResult {
                    class: EventClass::NoIon,
                    fundamental_hz: None,
                    snr_db: None,
                    peak_count: 0,
                    timestamp: Utc::now(),
                    sequence,
                    fft_len: 1024,
                    fs_hz: 2_400_000.0,
                })
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(60));
        drop(result_tx);
        handle.join().unwrap();

        let snap = aggregator::lock(&shared).snapshot();
        assert_eq!(snap.counts.no_ion, 3);
        assert!(snap.rate_ticks >= 1);
    }
}
