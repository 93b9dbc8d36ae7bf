//! Integration tests for the routing half of the pipeline.
//!
//! Drives facts through the router's decision table and the worker contract
//! against an in-memory ledger and fake stages: the happy path from
//! `link.added` to `publish.completed`, and the failure path from repeated
//! stage errors to a dead-letter record.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    use lifestream_core::{SubjectId, SubjectKind};
    use lifestream_events::{
        ContentFetched, EnrichmentCompleted, EventKind, EventRecord, PublishCompleted,
        WorkCommand, WorkKind,
    };

    use crate::config::WorkRetryConfig;
    use crate::ledger::{EventLedger, InMemoryLedger};
    use crate::router::{route_decision, RouterAction, RouterChecks};
    use crate::workers::{complete_work, StageError, StageWorker};

    fn record_for(kind: &EventKind, subject_id: &SubjectId) -> EventRecord {
        EventRecord {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            source: "chrome".into(),
            subject_kind: SubjectKind::Link,
            subject_id: subject_id.clone(),
            event_type: kind.event_type().to_string(),
            schema_version: kind.schema_version(),
            payload: kind.payload().unwrap(),
            correlation_id: None,
            causation_id: None,
            forwarded: true,
        }
    }

    struct ScriptedStage {
        kind: WorkKind,
        agent: &'static str,
        outcome: Result<EventKind, String>,
    }

    #[async_trait]
    impl StageWorker for ScriptedStage {
        fn kind(&self) -> WorkKind {
            self.kind
        }

        fn agent_name(&self) -> &'static str {
            self.agent
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(&self, _work: &WorkCommand) -> Result<EventKind, StageError> {
            self.outcome.clone().map_err(StageError::new)
        }
    }

    fn expect_work(action: Option<RouterAction>) -> WorkCommand {
        match action {
            Some(RouterAction::EmitWork(work)) => work,
            other => panic!("expected work emission, got {other:?}"),
        }
    }

    /// Fold one fact through the router and the scripted worker, returning
    /// the fact the worker appended.
    async fn advance(
        ledger: &InMemoryLedger,
        record: &EventRecord,
        kind: &EventKind,
        stage_outcome: Result<EventKind, String>,
        expected_kind: WorkKind,
        agent: &'static str,
    ) -> EventRecord {
        let work = expect_work(route_decision(
            record,
            kind,
            &RouterChecks::default(),
            &WorkRetryConfig::default(),
        ));
        assert_eq!(work.work_type, expected_kind);

        let stage = ScriptedStage {
            kind: expected_kind,
            agent,
            outcome: stage_outcome,
        };
        let before = ledger.records().len();
        complete_work(&stage, ledger, &work).await.unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), before + 1);
        records.last().cloned().unwrap()
    }

    #[tokio::test]
    async fn happy_path_flows_from_capture_to_publication() {
        let ledger = InMemoryLedger::new();
        let subject_id = SubjectId::from("link:3b2a9f10c4d1e8aa");

        let link_added = EventKind::LinkAdded(lifestream_events::LinkAdded {
            url: "https://example.com/a?a=1&b=2".into(),
            url_norm: Some("https://example.com/a?a=1&b=2".into()),
        });
        let capture = record_for(&link_added, &subject_id);
        let correlation = capture.event_id;

        // capture → fetch → content.fetched
        let fetched_kind = EventKind::ContentFetched(ContentFetched {
            final_url: "https://example.com/a?a=1&b=2".into(),
            title: Some("T".into()),
            text_content: Some("body text".into()),
            html_storage_key: None,
            fetch_error: None,
        });
        let fetched = advance(
            &ledger,
            &capture,
            &link_added,
            Ok(fetched_kind.clone()),
            WorkKind::FetchLink,
            "fetcher",
        )
        .await;
        assert_eq!(fetched.event_type, "content.fetched");
        assert_eq!(fetched.correlation_id, Some(correlation));
        assert_eq!(fetched.causation_id, Some(capture.event_id));

        // content.fetched → enrich → enrichment.completed
        let enriched_kind = EventKind::EnrichmentCompleted(EnrichmentCompleted {
            tags: vec!["x".into(), "y".into()],
            summary_short: Some("s".into()),
            summary_long: None,
            language: Some("en".into()),
            model_version: Some("m-1".into()),
        });
        let fetched_typed = fetched.kind().unwrap().unwrap();
        let enriched = advance(
            &ledger,
            &fetched,
            &fetched_typed,
            Ok(enriched_kind.clone()),
            WorkKind::EnrichLink,
            "enricher",
        )
        .await;
        assert_eq!(enriched.event_type, "enrichment.completed");
        assert_eq!(enriched.correlation_id, Some(correlation));

        // enrichment.completed → publish → publish.completed
        let enriched_typed = enriched.kind().unwrap().unwrap();
        let published = advance(
            &ledger,
            &enriched,
            &enriched_typed,
            Ok(EventKind::PublishCompleted(PublishCompleted {
                published_at: Some(Utc::now()),
            })),
            WorkKind::PublishLink,
            "publisher",
        )
        .await;
        assert_eq!(published.event_type, "publish.completed");
        // The correlation id ties the whole run back to the capture fact.
        assert_eq!(published.correlation_id, Some(correlation));
    }

    #[tokio::test]
    async fn three_transport_failures_end_in_one_dead_letter() {
        let ledger = InMemoryLedger::new();
        let subject_id = SubjectId::from("link:3b2a9f10c4d1e8aa");

        let link_added = EventKind::LinkAdded(lifestream_events::LinkAdded {
            url: "https://example.com/a".into(),
            url_norm: None,
        });
        let capture = record_for(&link_added, &subject_id);

        let mut work = expect_work(route_decision(
            &capture,
            &link_added,
            &RouterChecks::default(),
            &WorkRetryConfig::default(),
        ));

        let mut dead_letter = None;
        for round in 1..=3 {
            assert_eq!(work.attempt, round);

            // The stage fails; the worker appends work.failed.
            let stage = ScriptedStage {
                kind: WorkKind::FetchLink,
                agent: "fetcher",
                outcome: Err("connect timeout".to_string()),
            };
            complete_work(&stage, &ledger, &work).await.unwrap();

            let failed = ledger.records().last().cloned().unwrap();
            assert_eq!(failed.event_type, "work.failed");
            let failed_kind = failed.kind().unwrap().unwrap();

            // The router reacts to the materialized failure fact.
            match route_decision(
                &failed,
                &failed_kind,
                &RouterChecks::default(),
                &WorkRetryConfig::default(),
            )
            .unwrap()
            {
                RouterAction::EmitWork(retry) => {
                    assert!(round < 3, "retry past the attempt budget");
                    assert_eq!(retry.attempt, round + 1);
                    assert_eq!(retry.last_error.as_deref(), Some("connect timeout"));
                    work = retry;
                }
                RouterAction::DeadLetter(dead) => {
                    assert_eq!(round, 3, "dead-lettered too early");
                    dead_letter = Some(dead);
                }
                RouterAction::Skip(reason) => panic!("unexpected skip: {reason}"),
            }
        }

        // One dead letter, carrying the final attempt of the original work.
        let dead = dead_letter.expect("work never dead-lettered");
        assert_eq!(dead.original_work.subject_id, subject_id);
        assert_eq!(dead.original_work.attempt, 3);
        assert_eq!(dead.final_error, "connect timeout");
        assert_eq!(dead.agent, "fetcher");

        // The ledger shows max_attempts work.failed facts for this subject,
        // all tied to the same triggering event.
        let failures: Vec<_> = ledger
            .records()
            .into_iter()
            .filter(|r| r.event_type == "work.failed")
            .collect();
        assert_eq!(failures.len(), 3);
        for failure in &failures {
            let Some(EventKind::WorkFailed(payload)) = failure.kind().unwrap() else {
                panic!("expected work.failed payload");
            };
            assert_eq!(payload.work_message.subject_id, subject_id);
            assert_eq!(
                payload.work_message.triggered_by_event_id,
                dead.original_work.triggered_by_event_id
            );
        }
    }
}
