use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::{
    finalize_lap, finalize_session, AggregationState, Disposition, LapSummary, RecordCorrelator,
    SessionSummary,
};
use crate::codec::MessageSink;
use crate::index::{SampleIndex, SourceAuthenticator};
use crate::message::{MessageKind, StreamEvent};
use crate::{MergeError, MergeParams, StreamRole};

#[derive(Clone, Debug, Default, Serialize)]
pub struct MergeReport {
    pub samples_indexed: usize,
    pub samples_skipped: usize,
    pub primary_events: usize,
    pub records_seen: usize,
    pub records_matched: usize,
    pub records_dropped: usize,
    pub unrecognized_dropped: usize,
    pub events_written: usize,
    pub degenerate_intervals: usize,
    pub laps: Vec<LapSummary>,
    pub sessions: Vec<SessionSummary>,
}

/// Per-event dispatch over the primary stream. Owns the aggregation state for
/// exactly one merge.
pub struct MergePipeline<'a> {
    params: &'a MergeParams,
    correlator: RecordCorrelator<'a>,
    authenticator: SourceAuthenticator,
    state: AggregationState,
    report: MergeReport,
}

impl<'a> MergePipeline<'a> {
    pub fn new(index: &'a SampleIndex, params: &'a MergeParams) -> Self {
        let authenticator = SourceAuthenticator::new(StreamRole::Primary, &params.primary_source)
            .require_tag(params.require_primary_source);
        Self {
            params,
            correlator: RecordCorrelator::new(index),
            authenticator,
            state: AggregationState::new(),
            report: MergeReport {
                samples_indexed: index.len(),
                samples_skipped: index.skipped(),
                ..MergeReport::default()
            },
        }
    }

    /// Process one primary event in place and decide whether it reaches the sink.
    /// Identity messages are forwarded once.
    pub fn dispatch(&mut self, event: &mut StreamEvent) -> Result<Disposition, MergeError> {
        self.report.primary_events += 1;
        if !event.kind().is_recognized() {
            debug!("dropping unrecognized {}", event.kind().label());
            self.report.unrecognized_dropped += 1;
            return Ok(Disposition::Drop);
        }
        let msg = match event {
            StreamEvent::Definition(_) => return Ok(Disposition::Forward),
            StreamEvent::Data(msg) => msg,
        };

        match msg.kind {
            MessageKind::FileId => {
                self.authenticator.check(msg)?;
                Ok(Disposition::Forward)
            }
            MessageKind::Record => {
                self.report.records_seen += 1;
                let disposition = self.correlator.correlate(&mut self.state, msg);
                if disposition == Disposition::Drop {
                    self.report.records_dropped += 1;
                } else {
                    self.report.records_matched += 1;
                }
                Ok(disposition)
            }
            MessageKind::Lap => {
                let lap_number = self.report.laps.len() + 1;
                let summary =
                    finalize_lap(&mut self.state, msg, lap_number, &self.params.sub_sport);
                if summary.degenerate {
                    self.report.degenerate_intervals += 1;
                }
                self.report.laps.push(summary);
                Ok(Disposition::Rewritten)
            }
            MessageKind::Session => {
                let summary = finalize_session(&self.state, msg, &self.params.sub_sport);
                if summary.degenerate {
                    self.report.degenerate_intervals += 1;
                }
                self.report.sessions.push(summary);
                Ok(Disposition::Rewritten)
            }
            MessageKind::Other(_) | MessageKind::Unrecognized(_) => Ok(Disposition::Forward),
        }
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    pub fn into_report(self) -> MergeReport {
        self.report
    }
}

/// Merge `secondary` into `primary`, writing the result to `sink`.
///
/// The secondary stream is indexed completely before the first primary event is
/// read. The sink is finished on every path; when both the merge and the close
/// fail, the merge error is returned.
pub fn merge<P, Q, S>(
    primary: P,
    secondary: Q,
    sink: &mut S,
    params: &MergeParams,
) -> Result<MergeReport, MergeError>
where
    P: IntoIterator<Item = Result<StreamEvent, MergeError>>,
    Q: IntoIterator<Item = Result<StreamEvent, MergeError>>,
    S: MessageSink + ?Sized,
{
    let outcome = run(primary, secondary, sink, params);
    let closed = sink.finish();
    let report = outcome?;
    closed?;
    Ok(report)
}

fn run<P, Q, S>(
    primary: P,
    secondary: Q,
    sink: &mut S,
    params: &MergeParams,
) -> Result<MergeReport, MergeError>
where
    P: IntoIterator<Item = Result<StreamEvent, MergeError>>,
    Q: IntoIterator<Item = Result<StreamEvent, MergeError>>,
    S: MessageSink + ?Sized,
{
    params.validate()?;
    let index = SampleIndex::build(secondary, &params.secondary_source)?;
    let mut pipeline = MergePipeline::new(&index, params);

    for event in primary {
        let mut event = event?;
        if pipeline.dispatch(&mut event)?.is_emitted() {
            sink.write_event(&event)?;
            pipeline.report.events_written += 1;
        }
    }

    let report = pipeline.into_report();
    info!(
        "merged {} of {} primary records ({} dropped), {} laps, {} events written",
        report.records_matched,
        report.records_seen,
        report.records_dropped,
        report.laps.len(),
        report.events_written
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use crate::codec::{JsonLinesSink, MemorySink};
    use crate::message::{file_id, record, FieldValue, FitMessage, MessageDefinition};

    fn identity(tag: &str) -> StreamEvent {
        StreamEvent::Data(
            FitMessage::new(MessageKind::FileId)
                .with_field(file_id::MANUFACTURER, FieldValue::Text(tag.into())),
        )
    }

    fn sim_record(t: i64, alt: f64, dist: f64, speed: f64) -> StreamEvent {
        StreamEvent::Data(
            FitMessage::new(MessageKind::Record)
                .with_field(record::TIMESTAMP, FieldValue::Timestamp(t))
                .with_field(record::POSITION_LAT, FieldValue::Integer(100 + t))
                .with_field(record::POSITION_LONG, FieldValue::Integer(200 + t))
                .with_field(record::ALTITUDE, FieldValue::Float(alt))
                .with_field(record::DISTANCE, FieldValue::Float(dist))
                .with_field(record::SPEED, FieldValue::Float(speed)),
        )
    }

    fn device_record(t: i64) -> StreamEvent {
        StreamEvent::Data(
            FitMessage::new(MessageKind::Record)
                .with_field(record::TIMESTAMP, FieldValue::Timestamp(t))
                .with_field(record::DISTANCE, FieldValue::Float(7777.0))
                .with_field(record::SPEED, FieldValue::Float(0.1)),
        )
    }

    fn data(kind: MessageKind) -> StreamEvent {
        StreamEvent::Data(FitMessage::new(kind))
    }

    fn definition(kind: MessageKind) -> StreamEvent {
        StreamEvent::Definition(MessageDefinition {
            kind,
            local_number: 0,
            field_numbers: vec![253],
        })
    }

    fn ok(events: Vec<StreamEvent>) -> Vec<Result<StreamEvent, MergeError>> {
        events.into_iter().map(Ok).collect()
    }

    fn secondary() -> Vec<StreamEvent> {
        vec![
            identity("zwift"),
            sim_record(100, 10.0, 250.0, 5.0),
            sim_record(101, 12.0, 255.0, 6.0),
            sim_record(102, 11.0, 259.0, 4.0),
        ]
    }

    fn output_records(sink: &MemorySink) -> Vec<&FitMessage> {
        sink.messages()
            .filter(|m| m.kind == MessageKind::Record)
            .collect()
    }

    #[test]
    fn merges_matching_records_and_drops_the_rest() {
        let primary = vec![
            identity("garmin"),
            definition(MessageKind::Record),
            device_record(99),
            device_record(100),
            device_record(101),
            device_record(102),
            device_record(200),
            data(MessageKind::Other("event".into())),
            data(MessageKind::Lap),
            data(MessageKind::Session),
        ];
        let mut sink = MemorySink::new();
        let report = merge(ok(primary), ok(secondary()), &mut sink, &MergeParams::default()).unwrap();

        assert!(sink.finished);
        let records = output_records(&sink);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.timestamp() != Some(200)));
        let distances: Vec<f64> = records.iter().filter_map(|r| r.f64_field("distance")).collect();
        assert_eq!(distances, vec![0.0, 5.0, 9.0]);
        assert_eq!(records[2].f64_field("position_lat"), Some(202.0));

        assert_eq!(report.records_seen, 5);
        assert_eq!(report.records_matched, 3);
        assert_eq!(report.records_dropped, 2);
        assert_eq!(report.samples_indexed, 3);
        assert_eq!(report.events_written, sink.events.len());
        assert_eq!(sink.count_kind(&MessageKind::Other("event".into())), 1);
        assert_eq!(sink.count_kind(&MessageKind::Record), 4);

        let lap = &report.laps[0];
        assert_eq!(lap.ascent_m, 2.0);
        assert_eq!(lap.descent_m, 1.0);
        assert_eq!(lap.distance_m, 9.0);
        assert_eq!(lap.elapsed_s, 2);
        assert_eq!(lap.avg_speed_mps, 4.5);
        let session = &report.sessions[0];
        assert_eq!(session.distance_m, 9.0);
        assert_eq!(session.max_speed_mps, 6.0);
        assert!(session.ascent_m >= lap.ascent_m);
    }

    #[test]
    fn identity_message_is_written_exactly_once() {
        let mut sink = MemorySink::new();
        merge(
            ok(vec![identity("garmin"), device_record(100)]),
            ok(secondary()),
            &mut sink,
            &MergeParams::default(),
        )
        .unwrap();
        assert_eq!(sink.count_kind(&MessageKind::FileId), 1);
        assert_eq!(sink.events[0].kind(), &MessageKind::FileId);
    }

    #[test]
    fn unrecognized_messages_and_definitions_are_dropped() {
        let primary = vec![
            identity("garmin"),
            definition(MessageKind::Unrecognized(65_300)),
            data(MessageKind::Unrecognized(65_300)),
            definition(MessageKind::Lap),
        ];
        let mut sink = MemorySink::new();
        let report = merge(ok(primary), ok(secondary()), &mut sink, &MergeParams::default()).unwrap();
        assert_eq!(report.unrecognized_dropped, 2);
        assert_eq!(sink.events.len(), 2);
        assert!(sink.events.iter().all(|e| e.kind().is_recognized()));
    }

    #[test]
    fn foreign_secondary_aborts_before_any_output() {
        let mut sim = secondary();
        sim[0] = identity("garmin");
        let mut sink = MemorySink::new();
        let err = merge(
            ok(vec![identity("garmin"), device_record(100)]),
            ok(sim),
            &mut sink,
            &MergeParams::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MergeError::SourceMismatch {
                stream: StreamRole::Secondary,
                ..
            }
        ));
        assert!(sink.events.is_empty());
        assert!(sink.finished);
    }

    #[test]
    fn foreign_primary_aborts_and_closes_sink() {
        let mut sink = MemorySink::new();
        let err = merge(
            ok(vec![identity("zwift"), device_record(100)]),
            ok(secondary()),
            &mut sink,
            &MergeParams::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MergeError::SourceMismatch {
                stream: StreamRole::Primary,
                ..
            }
        ));
        assert!(sink.events.is_empty());
        assert!(sink.finished);
    }

    #[test]
    fn untagged_primary_identity_obeys_require_flag() {
        let lenient = MergeParams::default();
        let mut sink = MemorySink::new();
        assert!(merge(
            ok(vec![data(MessageKind::FileId)]),
            ok(secondary()),
            &mut sink,
            &lenient
        )
        .is_ok());

        let strict = MergeParams {
            require_primary_source: true,
            ..MergeParams::default()
        };
        let mut sink = MemorySink::new();
        assert!(merge(
            ok(vec![data(MessageKind::FileId)]),
            ok(secondary()),
            &mut sink,
            &strict
        )
        .is_err());
    }

    #[test]
    fn read_failure_mid_stream_is_fatal() {
        let primary = vec![
            Ok(identity("garmin")),
            Ok(device_record(100)),
            Err(MergeError::StreamRead("unexpected end of file".into())),
            Ok(device_record(101)),
        ];
        let mut sink = MemorySink::new();
        let err = merge(primary, ok(secondary()), &mut sink, &MergeParams::default()).unwrap_err();
        assert!(matches!(err, MergeError::StreamRead(_)));
        assert_eq!(sink.events.len(), 2);
        assert!(sink.finished);
    }

    /// Rejects every write after the first `accept` events.
    struct FailingSink {
        accept: usize,
        written: usize,
        finished: bool,
    }

    impl MessageSink for FailingSink {
        fn write_event(&mut self, _event: &StreamEvent) -> Result<(), MergeError> {
            if self.written == self.accept {
                return Err(MergeError::StreamWrite("disk full".into()));
            }
            self.written += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<(), MergeError> {
            self.finished = true;
            Ok(())
        }
    }

    #[test]
    fn write_failure_is_fatal_and_closes_sink() {
        let primary = vec![
            Ok(identity("garmin")),
            Ok(device_record(100)),
            Ok(device_record(101)),
        ];
        let mut sink = FailingSink {
            accept: 1,
            written: 0,
            finished: false,
        };
        let err = merge(primary, ok(secondary()), &mut sink, &MergeParams::default()).unwrap_err();
        assert!(matches!(err, MergeError::StreamWrite(msg) if msg == "disk full"));
        assert_eq!(sink.written, 1);
        assert!(sink.finished);
    }

    struct BrokenWriter;

    impl io::Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn unflushable_output_surfaces_as_write_error() {
        let primary = vec![Ok(identity("garmin")), Ok(device_record(100))];
        let mut sink = JsonLinesSink::new(BrokenWriter);
        let err = merge(primary, ok(secondary()), &mut sink, &MergeParams::default()).unwrap_err();
        assert!(matches!(err, MergeError::StreamWrite(_)));
        // the sink was closed despite the failure
        assert!(matches!(
            sink.write_event(&identity("garmin")),
            Err(MergeError::StreamWrite(msg)) if msg == "sink already closed"
        ));
    }

    #[test]
    fn back_to_back_laps_produce_zero_speed_sentinel() {
        let primary = vec![
            identity("garmin"),
            device_record(100),
            device_record(101),
            data(MessageKind::Lap),
            data(MessageKind::Lap),
            data(MessageKind::Session),
        ];
        let mut sink = MemorySink::new();
        let report = merge(ok(primary), ok(secondary()), &mut sink, &MergeParams::default()).unwrap();
        assert_eq!(report.laps.len(), 2);
        assert!(!report.laps[0].degenerate);
        assert!(report.laps[1].degenerate);
        assert_eq!(report.laps[1].avg_speed_mps, 0.0);
        assert_eq!(report.degenerate_intervals, 1);

        let laps: Vec<&FitMessage> = sink.messages().filter(|m| m.kind == MessageKind::Lap).collect();
        assert_eq!(laps[1].f64_field("avg_speed"), Some(0.0));
        assert_eq!(laps[1].f64_field("total_ascent"), Some(0.0));
    }

    #[test]
    fn lap_accumulators_restart_after_each_boundary() {
        let mut sim = vec![identity("zwift")];
        for (i, alt) in [100.0, 103.0, 101.0, 106.0, 104.0].iter().enumerate() {
            let t = 10 + i as i64;
            sim.push(sim_record(t, *alt, i as f64 * 10.0, 3.0 + i as f64));
        }
        let index = SampleIndex::build(ok(sim), "zwift").unwrap();
        let params = MergeParams::default();
        let mut pipeline = MergePipeline::new(&index, &params);

        let mut laps_seen = Vec::new();
        for t in 10..15 {
            pipeline.dispatch(&mut device_record(t)).unwrap();
            if t == 12 {
                pipeline.dispatch(&mut data(MessageKind::Lap)).unwrap();
                let state = pipeline.state();
                assert_eq!(state.lap_ascent, 0.0);
                assert_eq!(state.lap_max_speed, 0.0);
                assert_eq!(state.lap_distance_base, state.total_distance);
                laps_seen.push(state.total_distance);
            }
        }
        pipeline.dispatch(&mut data(MessageKind::Lap)).unwrap();

        let report = pipeline.into_report();
        assert_eq!(laps_seen, vec![20.0]);
        assert_eq!(report.laps[0].ascent_m, 3.0);
        assert_eq!(report.laps[0].descent_m, 2.0);
        assert_eq!(report.laps[1].ascent_m, 5.0);
        assert_eq!(report.laps[1].descent_m, 2.0);
        assert_eq!(report.laps[1].distance_m, 20.0);
        assert_eq!(report.laps[1].max_speed_mps, 7.0);
    }

    #[test]
    fn dispositions_are_explicit() {
        let index = SampleIndex::build(ok(secondary()), "zwift").unwrap();
        let params = MergeParams::default();
        let mut pipeline = MergePipeline::new(&index, &params);
        assert_eq!(
            pipeline.dispatch(&mut identity("garmin")).unwrap(),
            Disposition::Forward
        );
        assert_eq!(
            pipeline.dispatch(&mut device_record(100)).unwrap(),
            Disposition::Rewritten
        );
        assert_eq!(
            pipeline.dispatch(&mut device_record(500)).unwrap(),
            Disposition::Drop
        );
        assert_eq!(
            pipeline.dispatch(&mut definition(MessageKind::Record)).unwrap(),
            Disposition::Forward
        );
        assert_eq!(pipeline.report().primary_events, 4);
    }
}
