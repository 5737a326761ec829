//! Real-time loop: one line from the glove in, at most one play command out.
//!
//! ```text
//! AwaitingSample → SampleReceived → Classified → Actuated → AwaitingSample
//! ```
//!
//! Each `step` runs one cycle. Unparsable lines and read timeouts return to
//! `AwaitingSample` without touching the model.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actuator::{ActuationSink, SinkError};
use crate::gesture_classifier::GestureClassifier;
use crate::gesture_map::GestureLabel;
use crate::pipeline::PipelineError;
use crate::sample_parser::SampleParser;
use crate::source::{SampleSource, SourceError};

/// Minimum spacing between "skipped line" debug messages.
const MALFORMED_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Commands within this many ms of the previous one are dropped.
    /// 0 sends every classification that maps to a clip.
    pub actuation_cooldown_ms: u64,
    /// Transient source or sink errors in a row before the loop gives up
    pub max_consecutive_failures: u32,
    /// Read timeouts do not count as failures; this bounds how long the loop
    /// waits without a line. 0 waits forever.
    pub idle_timeout_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            actuation_cooldown_ms: 0,
            max_consecutive_failures: 10,
            idle_timeout_ms: 0,
        }
    }
}

impl LoopConfig {
    pub fn actuation_cooldown(&self) -> Duration {
        Duration::from_millis(self.actuation_cooldown_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingSample,
    SampleReceived,
    Classified,
    Actuated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Read timed out or failed transiently
    Idle,
    /// Line did not contain a sample
    Skipped,
    /// Classified; no command was sent
    Classified(GestureLabel),
    Actuated(GestureLabel),
}

#[derive(Error, Debug)]
pub enum LoopError {
    /// Samples no longer fit the trained pipeline
    #[error("classification failed: {0}")]
    Classification(#[source] PipelineError),

    #[error("sample source failed after {failures} consecutive errors: {source}")]
    SourceFailed {
        failures: u32,
        #[source]
        source: SourceError,
    },

    #[error("no line from the sample source for {0:?}")]
    SourceIdle(Duration),

    #[error("actuation sink failed after {failures} consecutive errors: {source}")]
    SinkFailed {
        failures: u32,
        #[source]
        source: SinkError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub lines: u64,
    pub skipped: u64,
    pub classified: u64,
    pub actuated: u64,
    pub suppressed: u64,
    pub source_errors: u64,
    pub sink_errors: u64,
    pub gestures: BTreeMap<String, u64>,
}

pub struct InferenceLoop<S: SampleSource, A: ActuationSink> {
    source: S,
    sink: A,
    classifier: GestureClassifier,
    parser: SampleParser,
    config: LoopConfig,
    state: LoopState,
    stats: LoopStats,
    source_failures: u32,
    sink_failures: u32,
    idle_since: Option<Instant>,
    last_actuation: Option<Instant>,
    last_malformed_log: Option<Instant>,
    malformed_since_log: u64,
}

impl<S: SampleSource, A: ActuationSink> InferenceLoop<S, A> {
    pub fn new(
        source: S,
        sink: A,
        classifier: GestureClassifier,
        parser: SampleParser,
        config: LoopConfig,
    ) -> Self {
        Self {
            source,
            sink,
            classifier,
            parser,
            config,
            state: LoopState::AwaitingSample,
            stats: LoopStats::default(),
            source_failures: 0,
            sink_failures: 0,
            idle_since: None,
            last_actuation: None,
            last_malformed_log: None,
            malformed_since_log: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn into_parts(self) -> (S, A) {
        (self.source, self.sink)
    }

    /// One read → classify → actuate cycle.
    pub fn step(&mut self) -> Result<StepOutcome, LoopError> {
        self.state = LoopState::AwaitingSample;

        let line = match self.source.read_line() {
            Ok(Some(line)) => {
                self.source_failures = 0;
                self.idle_since = None;
                line
            }
            Ok(None) => {
                self.source_failures = 0;
                let since = *self.idle_since.get_or_insert_with(Instant::now);
                if let Some(limit) = self.config.idle_timeout() {
                    if since.elapsed() >= limit {
                        return Err(LoopError::SourceIdle(since.elapsed()));
                    }
                }
                return Ok(StepOutcome::Idle);
            }
            Err(SourceError::Transient(e)) => {
                self.stats.source_errors += 1;
                self.source_failures += 1;
                warn!(failures = self.source_failures, "sample source read error: {e}");
                if self.source_failures >= self.config.max_consecutive_failures {
                    return Err(LoopError::SourceFailed {
                        failures: self.source_failures,
                        source: SourceError::Transient(e),
                    });
                }
                return Ok(StepOutcome::Idle);
            }
            Err(e) => {
                self.stats.source_errors += 1;
                return Err(LoopError::SourceFailed {
                    failures: self.source_failures + 1,
                    source: e,
                });
            }
        };
        self.stats.lines += 1;

        let Some(sample) = self.parser.parse(&line) else {
            self.note_malformed(&line);
            return Ok(StepOutcome::Skipped);
        };
        self.state = LoopState::SampleReceived;

        let label = self
            .classifier
            .classify(&sample)
            .map_err(LoopError::Classification)?;
        self.state = LoopState::Classified;
        self.stats.classified += 1;
        *self.stats.gestures.entry(label.name.clone()).or_insert(0) += 1;
        debug!(cluster = label.cluster, gesture = %label.name, "classified");

        let Some(command) = label.command else {
            return Ok(StepOutcome::Classified(label));
        };

        let cooldown = self.config.actuation_cooldown();
        if let Some(last) = self.last_actuation {
            if !cooldown.is_zero() && last.elapsed() < cooldown {
                self.stats.suppressed += 1;
                debug!(%command, "within cooldown, not sent");
                return Ok(StepOutcome::Classified(label));
            }
        }

        match self.sink.send(command) {
            Ok(()) => {
                self.sink_failures = 0;
                self.last_actuation = Some(Instant::now());
                self.state = LoopState::Actuated;
                self.stats.actuated += 1;
                info!(gesture = %label.name, %command, "actuated");
                Ok(StepOutcome::Actuated(label))
            }
            Err(SinkError::Transient(e)) => {
                self.stats.sink_errors += 1;
                self.sink_failures += 1;
                warn!(failures = self.sink_failures, %command, "actuation failed: {e}");
                if self.sink_failures >= self.config.max_consecutive_failures {
                    return Err(LoopError::SinkFailed {
                        failures: self.sink_failures,
                        source: SinkError::Transient(e),
                    });
                }
                Ok(StepOutcome::Classified(label))
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                Err(LoopError::SinkFailed {
                    failures: self.sink_failures + 1,
                    source: e,
                })
            }
        }
    }

    /// Steps until a message arrives on `shutdown` or a fatal error occurs.
    /// A dropped shutdown sender does not stop the loop.
    pub fn run(&mut self, shutdown: &Receiver<()>) -> Result<LoopStats, LoopError> {
        info!(run_id = self.classifier.pipeline().run_id(), "inference loop started");
        loop {
            match shutdown.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
            self.step()?;
        }
        info!(
            lines = self.stats.lines,
            classified = self.stats.classified,
            actuated = self.stats.actuated,
            "inference loop stopped"
        );
        Ok(self.stats.clone())
    }

    fn note_malformed(&mut self, line: &str) {
        self.stats.skipped += 1;
        self.malformed_since_log += 1;

        let due = self
            .last_malformed_log
            .map_or(true, |t| t.elapsed() >= MALFORMED_LOG_INTERVAL);
        if due {
            debug!(
                skipped = self.malformed_since_log,
                line,
                "line without a sample skipped"
            );
            self.last_malformed_log = Some(Instant::now());
            self.malformed_since_log = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    use super::*;
    use crate::actuator::{ActuationCommand, WriterSink};
    use crate::gesture_map::GestureMap;
    use crate::kmeans::ClusterModel;
    use crate::pipeline::TrainedPipeline;
    use crate::source::ChannelSource;
    use crate::standardizer::Standardizer;
    use crate::types::FeatureSet;

    fn classifier(feature_set: FeatureSet) -> GestureClassifier {
        let mut rows = vec![
            vec![150.0, 150.0, 150.0, 150.0, 150.0],
            vec![900.0, 150.0, 150.0, 150.0, 150.0],
            vec![150.0, 900.0, 150.0, 150.0, 150.0],
        ];
        if feature_set == FeatureSet::FlexGyro {
            for (i, row) in rows.iter_mut().enumerate() {
                row.extend([i as f32, 0.0, 0.0]);
            }
        }
        let scaler = Standardizer::fit(feature_set, &rows).unwrap();
        let centroids = scaler.transform_batch(&rows).unwrap();
        let pipeline =
            TrainedPipeline::new("t".into(), scaler, ClusterModel::from_centroids(centroids));
        let map = GestureMap::new(Some("t".into()))
            .with_entry(0, "rest", None)
            .with_entry(1, "thumb_bent", Some(1))
            .with_entry(2, "index_bent", Some(2));
        GestureClassifier::new(Arc::new(pipeline), map)
    }

    /// Replays scripted read results, then disconnects.
    struct Scripted(VecDeque<Result<Option<String>, SourceError>>);

    impl SampleSource for Scripted {
        fn read_line(&mut self) -> Result<Option<String>, SourceError> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Disconnected("script done".into())))
        }
    }

    fn lines(lines: &[&str]) -> Scripted {
        Scripted(lines.iter().map(|l| Ok(Some(l.to_string()))).collect())
    }

    struct FailingSink(io::ErrorKind);

    impl ActuationSink for FailingSink {
        fn send(&mut self, _command: ActuationCommand) -> Result<(), SinkError> {
            Err(io::Error::new(self.0, "sink down").into())
        }
    }

    fn looped<S: SampleSource, A: ActuationSink>(source: S, sink: A) -> InferenceLoop<S, A> {
        InferenceLoop::new(
            source,
            sink,
            classifier(FeatureSet::Flex),
            SampleParser::default(),
            LoopConfig::default(),
        )
    }

    #[test]
    fn thumb_reading_plays_clip_one() {
        let mut l = looped(
            lines(&["1234 890 160 140 150 150 5 -3 2"]),
            WriterSink::new(Vec::new()),
        );
        let outcome = l.step().unwrap();
        assert!(matches!(outcome, StepOutcome::Actuated(ref g) if g.name == "thumb_bent"));
        assert_eq!(l.state(), LoopState::Actuated);
        let (_, sink) = l.into_parts();
        assert_eq!(sink.into_inner(), b"PLAY:1\n");
    }

    #[test]
    fn silent_gesture_is_classified_without_command() {
        let mut l = looped(
            lines(&["1 150 150 150 150 150 0 0 0"]),
            WriterSink::new(Vec::new()),
        );
        assert!(matches!(l.step().unwrap(), StepOutcome::Classified(ref g) if g.name == "rest"));
        assert_eq!(l.state(), LoopState::Classified);
        assert!(l.into_parts().1.into_inner().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut l = looped(
            lines(&["boot ok", "1 2 3", "", "7 150 880 150 150 150 0 0 0"]),
            WriterSink::new(Vec::new()),
        );
        for _ in 0..3 {
            assert_eq!(l.step().unwrap(), StepOutcome::Skipped);
            assert_eq!(l.state(), LoopState::AwaitingSample);
        }
        assert!(matches!(l.step().unwrap(), StepOutcome::Actuated(_)));
        assert_eq!(l.stats().skipped, 3);
        assert_eq!(l.into_parts().1.into_inner(), b"PLAY:2\n");
    }

    #[test]
    fn timeouts_are_idle() {
        let mut l = looped(Scripted(VecDeque::from([Ok(None)])), WriterSink::new(Vec::new()));
        assert_eq!(l.step().unwrap(), StepOutcome::Idle);
        assert_eq!(l.state(), LoopState::AwaitingSample);
    }

    #[test]
    fn silence_past_the_idle_timeout_stops_the_loop() {
        let mut l = InferenceLoop::new(
            Scripted(VecDeque::from([
                Ok(None),
                Ok(Some("1 150 150 150 150 150 0 0 0".to_string())),
                Ok(None),
                Ok(None),
            ])),
            WriterSink::new(Vec::new()),
            classifier(FeatureSet::Flex),
            SampleParser::default(),
            LoopConfig {
                idle_timeout_ms: 20,
                ..LoopConfig::default()
            },
        );
        assert_eq!(l.step().unwrap(), StepOutcome::Idle);
        std::thread::sleep(Duration::from_millis(30));
        // A line restarts the idle clock
        assert!(matches!(l.step().unwrap(), StepOutcome::Classified(_)));
        assert_eq!(l.step().unwrap(), StepOutcome::Idle);
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(l.step(), Err(LoopError::SourceIdle(d)) if d >= Duration::from_millis(20)));
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        // Pipeline trained with gyro; bare schema yields flex-only samples
        let mut l = InferenceLoop::new(
            lines(&["150 150 150 150 150"]),
            WriterSink::new(Vec::new()),
            classifier(FeatureSet::FlexGyro),
            SampleParser::new(crate::sample_parser::LineSchema::BARE),
            LoopConfig::default(),
        );
        match l.step() {
            Err(LoopError::Classification(e)) => assert!(e.is_dimension_mismatch()),
            other => panic!("expected classification error, got {other:?}"),
        }
    }

    #[test]
    fn transient_source_errors_escalate() {
        let script = (0..3)
            .map(|_| {
                Err(SourceError::Transient(io::Error::new(
                    io::ErrorKind::Other,
                    "framing",
                )))
            })
            .collect();
        let mut l = InferenceLoop::new(
            Scripted(script),
            WriterSink::new(Vec::new()),
            classifier(FeatureSet::Flex),
            SampleParser::default(),
            LoopConfig {
                max_consecutive_failures: 3,
                ..LoopConfig::default()
            },
        );
        assert_eq!(l.step().unwrap(), StepOutcome::Idle);
        assert_eq!(l.step().unwrap(), StepOutcome::Idle);
        assert!(matches!(
            l.step(),
            Err(LoopError::SourceFailed { failures: 3, .. })
        ));
    }

    #[test]
    fn disconnected_source_stops_the_loop() {
        let mut l = looped(lines(&[]), WriterSink::new(Vec::new()));
        assert!(matches!(l.step(), Err(LoopError::SourceFailed { .. })));
    }

    #[test]
    fn transient_sink_errors_keep_running_until_limit() {
        let thumb = "1 890 160 140 150 150 0 0 0";
        let mut l = InferenceLoop::new(
            lines(&[thumb, thumb]),
            FailingSink(io::ErrorKind::TimedOut),
            classifier(FeatureSet::Flex),
            SampleParser::default(),
            LoopConfig {
                max_consecutive_failures: 2,
                ..LoopConfig::default()
            },
        );
        assert!(matches!(l.step().unwrap(), StepOutcome::Classified(_)));
        assert!(matches!(
            l.step(),
            Err(LoopError::SinkFailed { failures: 2, .. })
        ));
    }

    #[test]
    fn disconnected_sink_is_fatal() {
        let mut l = looped(
            lines(&["1 890 160 140 150 150 0 0 0"]),
            FailingSink(io::ErrorKind::BrokenPipe),
        );
        assert!(matches!(l.step(), Err(LoopError::SinkFailed { .. })));
    }

    #[test]
    fn cooldown_suppresses_repeated_commands() {
        let thumb = "1 890 160 140 150 150 0 0 0";
        let mut l = InferenceLoop::new(
            lines(&[thumb, thumb]),
            WriterSink::new(Vec::new()),
            classifier(FeatureSet::Flex),
            SampleParser::default(),
            LoopConfig {
                actuation_cooldown_ms: 60_000,
                ..LoopConfig::default()
            },
        );
        assert!(matches!(l.step().unwrap(), StepOutcome::Actuated(_)));
        assert!(matches!(l.step().unwrap(), StepOutcome::Classified(_)));
        assert_eq!(l.stats().suppressed, 1);
        assert_eq!(l.into_parts().1.into_inner(), b"PLAY:1\n");
    }

    #[test]
    fn run_stops_on_shutdown() {
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        line_tx.send("1 890 160 140 150 150 0 0 0".to_string()).unwrap();

        let mut l = looped(
            ChannelSource::new(line_rx, Duration::from_millis(5)),
            WriterSink::new(Vec::new()),
        );
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stop_tx.send(()).unwrap();
        });

        let stats = l.run(&stop_rx).unwrap();
        stopper.join().unwrap();
        drop(line_tx);

        assert_eq!(stats.actuated, 1);
        assert_eq!(stats.gestures.get("thumb_bent"), Some(&1));
    }
}
