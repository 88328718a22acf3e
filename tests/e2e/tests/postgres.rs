use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryArray, Decimal128Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use rstest::rstest;

use dest_postgres::{LoadMethod, PgType, PostgresClient, ReplaceStrategy};
use landfall_e2e::harness::{batch_file, bootstrap, run_load};
use landfall_engine::store::TableStore;
use landfall_engine::{JobKind, JobState, LoadJob};
use landfall_types::error::ErrorCategory;
use landfall_types::schema::{
    ColumnDef, ColumnHints, DataType as LogicalType, LogicalSchema, LogicalTable, DLT_ID_COLUMN,
    DLT_PARENT_ID_COLUMN,
};

fn events_schema(disposition: &str) -> LogicalSchema {
    LogicalSchema::new("shop").with_table(
        LogicalTable::new("events")
            .with_disposition(disposition)
            .with_column(ColumnDef::new("event_id", LogicalType::Bigint).primary_key())
            .with_column(ColumnDef::new("name", LogicalType::Text))
            .with_column(ColumnDef::new("amount", LogicalType::Decimal).with_precision(10, Some(2)))
            .with_column(ColumnDef::new("happened_at", LogicalType::Timestamp))
            .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text)),
    )
}

fn events(ids: &[i64]) -> RecordBatch {
    let names: Vec<String> = ids.iter().map(|id| format!("event {id}")).collect();
    let dlt_ids: Vec<String> = ids.iter().map(|id| format!("e{id}")).collect();
    let amounts = Decimal128Array::from(ids.iter().map(|id| i128::from(*id) * 150).collect::<Vec<_>>())
        .with_precision_and_scale(10, 2)
        .expect("amount precision must be valid");
    // 2024-01-15 09:50:00 UTC
    let happened = TimestampMicrosecondArray::from(vec![1_705_312_200_000_000_i64; ids.len()])
        .with_timezone("UTC");
    RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("event_id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("amount", DataType::Decimal128(10, 2), true),
            Field::new(
                "happened_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                true,
            ),
            Field::new(DLT_ID_COLUMN, DataType::Utf8, true),
        ])),
        vec![
            Arc::new(Int64Array::from(ids.to_vec())),
            Arc::new(StringArray::from(names)),
            Arc::new(amounts),
            Arc::new(happened),
            Arc::new(StringArray::from(dlt_ids)),
        ],
    )
    .expect("events batch must build")
}

fn text(values: &[&str]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

/// Run one `replace` load of `files` the way a loader does: prepare the
/// tables, run every job, then run the chain's follow-up jobs.
async fn replace_load(client: &PostgresClient, dir: &Path, load_id: &str, files: &[(&str, &[i64])]) -> Vec<LoadJob> {
    client
        .prepare_replace_tables(&["events"])
        .await
        .expect("replace tables must be prepared");
    let mut jobs = Vec::new();
    for (file_id, ids) in files {
        let path = batch_file(dir, "events", file_id, &events(ids)).expect("batch file");
        let (job, state) = run_load(client, "events", &path, load_id).await.expect("load must run");
        assert_eq!(state, JobState::Completed, "{file_id}");
        jobs.push(job);
    }
    client
        .create_table_chain_completed_followup_jobs(&["events"], &jobs)
        .await
        .expect("followup planning must succeed")
}

#[rstest]
#[case(ReplaceStrategy::TruncateAndInsert, LoadMethod::Insert)]
#[case(ReplaceStrategy::StagingOptimized, LoadMethod::Insert)]
#[case(ReplaceStrategy::TruncateAndInsert, LoadMethod::Copy)]
#[case(ReplaceStrategy::StagingOptimized, LoadMethod::Copy)]
#[tokio::test]
#[ignore = "requires docker"]
async fn replace_keeps_every_file_of_the_latest_load(
    #[case] strategy: ReplaceStrategy,
    #[case] load_method: LoadMethod,
) {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset(&format!("replace_{strategy}_{load_method}"));
    let dir = tempfile::tempdir().expect("must create tempdir");

    let result = async {
        let mut config = context.config(&dataset, strategy);
        config.load_method = load_method;
        let client = dest_postgres::connect(&config, events_schema("replace"))
            .await
            .expect("destination must connect");
        client.initialize_storage(None).await.expect("storage init must succeed");
        client.update_stored_schema(None).await.expect("schema upgrade must succeed");

        for (load_id, files, expected) in [
            ("1", [("r1a", &[1_i64, 2, 3][..]), ("r1b", &[4][..])], 4),
            ("2", [("r2a", &[7][..]), ("r2b", &[8][..])], 2),
        ] {
            let followups = replace_load(&client, dir.path(), load_id, &files).await;
            match strategy {
                ReplaceStrategy::TruncateAndInsert => assert!(followups.is_empty()),
                ReplaceStrategy::StagingOptimized => {
                    assert_eq!(followups.len(), 1);
                    for mut followup in followups {
                        assert_eq!(followup.kind(), JobKind::SwapStaging);
                        assert_eq!(client.run_job(&mut followup).await, &JobState::Completed);
                    }
                }
            }
            assert_eq!(
                context.table_row_count(&dataset, "events").await.expect("count"),
                expected,
                "after load {load_id}"
            );
        }

        let columns = client
            .store()
            .describe_table("events")
            .await
            .expect("describe must succeed")
            .expect("events must still exist after replace");
        let amount = columns.iter().find(|c| c.name == "amount").expect("amount column");
        assert_eq!(amount.native, PgType::Numeric(Some((10, 2))));

        let amounts = context
            .query_strings(&format!("SELECT amount::text FROM \"{dataset}\".events ORDER BY event_id"))
            .await
            .expect("amount query");
        assert_eq!(amounts, vec!["10.50".to_string(), "12.00".to_string()]);
        let happened = context
            .query_strings(&format!(
                "SELECT to_char(happened_at AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS') \
                 FROM \"{dataset}\".events LIMIT 1"
            ))
            .await
            .expect("timestamp query");
        assert_eq!(happened, vec!["2024-01-15 09:50:00".to_string()]);
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}

#[tokio::test]
#[ignore = "requires docker"]
async fn staging_replace_is_invisible_until_the_swap() {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset("staging_swap");
    let dir = tempfile::tempdir().expect("must create tempdir");

    let result = async {
        let client = context
            .connect(&dataset, ReplaceStrategy::StagingOptimized, events_schema("replace"))
            .await
            .expect("destination must connect");
        client.update_stored_schema(None).await.expect("schema upgrade must succeed");
        let first = replace_load(&client, dir.path(), "1", &[("s1", &[1, 2][..])]).await;
        for mut followup in first {
            client.run_job(&mut followup).await;
        }

        let second = replace_load(&client, dir.path(), "2", &[("s2a", &[5][..]), ("s2b", &[6][..]), ("s2c", &[7][..])]).await;
        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 2);
        let staged = context
            .table_row_count(&format!("{dataset}_staging"), "events")
            .await
            .expect("staging count");
        assert_eq!(staged, 3);

        let mut swap = second.into_iter().next().expect("swap followup");
        assert_eq!(swap.job_id(), "events.s2a.0.swap");
        assert_eq!(client.run_job(&mut swap).await, &JobState::Completed);
        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 3);
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}

#[tokio::test]
#[ignore = "requires docker"]
async fn merge_is_idempotent_and_removes_orphans() {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset("merge");
    let dir = tempfile::tempdir().expect("must create tempdir");
    let schema = events_schema("merge").with_table(
        LogicalTable::new("events__tags")
            .with_parent("events")
            .with_column(ColumnDef::new("tag", LogicalType::Text))
            .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text))
            .with_column(ColumnDef::new(DLT_PARENT_ID_COLUMN, LogicalType::Text)),
    );
    let tags = |ids: &[&str], parents: &[&str]| {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("tag", DataType::Utf8, true),
                Field::new(DLT_ID_COLUMN, DataType::Utf8, true),
                Field::new(DLT_PARENT_ID_COLUMN, DataType::Utf8, true),
            ])),
            vec![text(&vec!["t"; ids.len()]), text(ids), text(parents)],
        )
        .expect("tags batch must build")
    };

    let result = async {
        let client = context
            .connect(&dataset, ReplaceStrategy::TruncateAndInsert, schema)
            .await
            .expect("destination must connect");
        client.update_stored_schema(None).await.expect("schema upgrade must succeed");

        for load in ["1", "2"] {
            let path = batch_file(dir.path(), "events", &format!("m{load}"), &events(&[1, 2, 3]))
                .expect("batch file");
            let (_, state) = run_load(&client, "events", &path, load).await.expect("load must run");
            assert_eq!(state, JobState::Completed);
        }
        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 3);

        let child = batch_file(dir.path(), "events__tags", "c1", &tags(&["t1", "t3"], &["e1", "e3"]))
            .expect("batch file");
        run_load(&client, "events__tags", &child, "2").await.expect("load must run");

        let root = batch_file(dir.path(), "events", "m3", &events(&[1, 2])).expect("batch file");
        let child = batch_file(dir.path(), "events__tags", "c3", &tags(&["t1"], &["e1"])).expect("batch file");
        let (root_job, state) = run_load(&client, "events", &root, "3").await.expect("load must run");
        assert_eq!(state, JobState::Completed);
        let (child_job, state) = run_load(&client, "events__tags", &child, "3").await.expect("load must run");
        assert_eq!(state, JobState::Completed);

        let followups = client
            .create_table_chain_completed_followup_jobs(&["events", "events__tags"], &[root_job, child_job])
            .await
            .expect("followup planning must succeed");
        assert_eq!(followups.len(), 1);
        let mut followup = followups.into_iter().next().expect("one followup");
        assert_eq!(followup.kind(), JobKind::RemoveOrphans);
        assert_eq!(client.run_job(&mut followup).await, &JobState::Completed);

        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 2);
        let parents = context
            .query_strings(&format!("SELECT _dlt_parent_id FROM \"{dataset}\".events__tags"))
            .await
            .expect("tags query");
        assert_eq!(parents, vec!["e1".to_string()]);
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}

#[tokio::test]
#[ignore = "requires docker"]
async fn schema_evolution_adds_nullable_columns_and_bad_values_are_terminal() {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset("evolution");
    let dir = tempfile::tempdir().expect("must create tempdir");

    let result = async {
        let before = context
            .connect(&dataset, ReplaceStrategy::TruncateAndInsert, events_schema("append"))
            .await
            .expect("destination must connect");
        before.update_stored_schema(None).await.expect("schema upgrade must succeed");
        let path = batch_file(dir.path(), "events", "a1", &events(&[1, 2])).expect("batch file");
        run_load(&before, "events", &path, "1").await.expect("load must run");

        let evolved = events_schema("append");
        let evolved_table = evolved
            .get_table("events")
            .cloned()
            .expect("events table")
            .with_column(ColumnDef::new("score", LogicalType::Double).not_null());
        let after = context
            .connect(
                &dataset,
                ReplaceStrategy::TruncateAndInsert,
                LogicalSchema::new("shop").with_table(evolved_table),
            )
            .await
            .expect("destination must connect");
        let delta = after
            .update_stored_schema(None)
            .await
            .expect("schema upgrade must succeed")
            .expect("new column must produce a delta");
        assert_eq!(delta.new_columns("events").len(), 1);
        let view = after
            .get_storage_table("events")
            .await
            .expect("storage view must succeed")
            .expect("events must exist");
        let score = view.iter().find(|c| c.name == "score").expect("score column");
        assert!(score.nullable);
        assert_eq!(score.data_type, LogicalType::Double);

        let bad = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("event_id", DataType::Int64, false),
                Field::new("happened_at", DataType::Utf8, true),
            ])),
            vec![Arc::new(Int64Array::from(vec![9])), text(&["not a timestamp"])],
        )
        .expect("bad batch must build");
        let path = batch_file(dir.path(), "events", "a2", &bad).expect("batch file");
        let (_, state) = run_load(&after, "events", &path, "2").await.expect("load must run");
        let err = state.error().expect("bad values must fail the job");
        assert!(matches!(state, JobState::TerminalFailed(_)), "{state}");
        assert_eq!(err.category, ErrorCategory::Data);
        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 2);
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}

#[tokio::test]
#[ignore = "requires docker"]
async fn geometry_columns_accept_wkt_hex_and_wkb_but_not_bulk_load() {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset("geometry");
    let dir = tempfile::tempdir().expect("must create tempdir");
    let geometry = ColumnHints {
        geometry: true,
        ..ColumnHints::default()
    };
    let schema = LogicalSchema::new("geo").with_table(
        LogicalTable::new("places")
            .with_column(ColumnDef::new("name", LogicalType::Text))
            .with_column(ColumnDef::new("shape", LogicalType::Text).with_hints(geometry.clone()))
            .with_column(ColumnDef::new("raw_shape", LogicalType::Binary).with_hints(geometry)),
    );
    // POINT(1 2), little-endian WKB.
    let point_wkb: Vec<u8> = [
        &[0x01_u8, 0x01, 0x00, 0x00, 0x00][..],
        &1.0_f64.to_le_bytes(),
        &2.0_f64.to_le_bytes(),
    ]
    .concat();
    let point_hex: String = point_wkb.iter().map(|b| format!("{b:02x}")).collect();

    let result = async {
        let client = context
            .connect(&dataset, ReplaceStrategy::TruncateAndInsert, schema.clone())
            .await
            .expect("destination must connect");
        client.update_stored_schema(None).await.expect("schema upgrade must succeed");

        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("name", DataType::Utf8, true),
                Field::new("shape", DataType::Utf8, true),
                Field::new("raw_shape", DataType::Binary, true),
            ])),
            vec![
                text(&["wkt", "hex"]),
                text(&["POINT(1 2)", point_hex.as_str()]),
                Arc::new(BinaryArray::from(vec![Some(point_wkb.as_slice()), None])),
            ],
        )
        .expect("places batch must build");
        let path = batch_file(dir.path(), "places", "g1", &batch).expect("batch file");
        let (_, state) = run_load(&client, "places", &path, "1").await.expect("load must run");
        assert_eq!(state, JobState::Completed);

        let shapes = context
            .query_strings(&format!(
                "SELECT ST_AsText(shape) || '/' || ST_SRID(shape) FROM \"{dataset}\".places ORDER BY name DESC"
            ))
            .await
            .expect("geometry query");
        assert_eq!(shapes, vec!["POINT(1 2)/4326".to_string(), "POINT(1 2)/4326".to_string()]);
        let raw = context
            .query_strings(&format!(
                "SELECT ST_AsText(raw_shape) FROM \"{dataset}\".places WHERE raw_shape IS NOT NULL"
            ))
            .await
            .expect("geometry query");
        assert_eq!(raw, vec!["POINT(1 2)".to_string()]);

        let columns = client
            .store()
            .describe_table("places")
            .await
            .expect("describe must succeed")
            .expect("places must exist");
        let shape = columns.iter().find(|c| c.name == "shape").expect("shape column");
        assert_eq!(shape.native, PgType::Geometry { srid: 4326 });

        let mut config = context.config(&dataset, ReplaceStrategy::TruncateAndInsert);
        config.load_method = LoadMethod::Copy;
        let bulk = dest_postgres::connect(&config, schema)
            .await
            .expect("destination must connect");
        let path = batch_file(dir.path(), "places", "g2", &batch).expect("batch file");
        let (_, state) = run_load(&bulk, "places", &path, "2").await.expect("load must run");
        assert!(matches!(state, JobState::TerminalFailed(_)), "{state}");
        let err = state.error().expect("bulk load must fail");
        assert!(err.message.contains("geometry"), "{err}");
        assert_eq!(context.table_row_count(&dataset, "places").await.expect("count"), 2);
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}

#[tokio::test]
#[ignore = "requires docker"]
async fn storage_lifecycle_truncates_and_drops() {
    let context = bootstrap().await.expect("bootstrap must initialize test harness");
    let dataset = context.allocate_dataset("lifecycle");
    let dir = tempfile::tempdir().expect("must create tempdir");

    let result = async {
        let client = context
            .connect(&dataset, ReplaceStrategy::TruncateAndInsert, events_schema("append"))
            .await
            .expect("destination must connect");
        assert!(!client.is_storage_initialized().await.expect("check must succeed"));
        client.initialize_storage(None).await.expect("storage init must succeed");
        assert!(client.is_storage_initialized().await.expect("check must succeed"));
        client.update_stored_schema(None).await.expect("schema upgrade must succeed");
        assert!(client
            .update_stored_schema(None)
            .await
            .expect("second upgrade must succeed")
            .is_none());

        let path = batch_file(dir.path(), "events", "l1", &events(&[1, 2])).expect("batch file");
        run_load(&client, "events", &path, "1").await.expect("load must run");
        client
            .initialize_storage(Some(&["events".to_string()][..]))
            .await
            .expect("truncate must succeed");
        assert_eq!(context.table_row_count(&dataset, "events").await.expect("count"), 0);
        assert_eq!(context.table_row_count(&dataset, "_dlt_version").await.expect("count"), 1);

        client.drop_storage().await.expect("drop must succeed");
        assert!(!client.is_storage_initialized().await.expect("check must succeed"));
        assert!(client.store().list_tables().await.expect("list must succeed").is_empty());
    }
    .await;

    context.drop_dataset(&dataset).await.expect("dataset cleanup must succeed");
    result
}
