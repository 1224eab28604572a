use async_trait::async_trait;
use groundsql::embed::{cosine_similarity, Embedder, HashEmbedder};
use groundsql::store::{MemoryStore, VectorStore};
use groundsql::text::split_list;
use groundsql::{
    ColumnDetailInput, Config, ContextItem, DatabaseInfoInput, Engine, Error, ExampleInput,
    ReconcileMode, Result, TableInput, UpsertOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DB: &str = "assets_maintenance";
const DIMENSION: usize = 4096;

const THIRD_PARTY_COMPANIES: &str = r#"CREATE TABLE `Third_Party_Companies` (
  `company_id` INTEGER PRIMARY KEY,
  `company_type` VARCHAR(5) NOT NULL,
  `company_name` VARCHAR(255),
  `company_address` VARCHAR(255),
  `other_company_details` VARCHAR(255)
)"#;

const MAINTENANCE_CONTRACTS: &str = r#"CREATE TABLE `Maintenance_Contracts` (
  `maintenance_contract_id` INTEGER PRIMARY KEY,
  `maintenance_contract_company_id` INTEGER NOT NULL,
  `contract_start_date` DATETIME,
  `contract_end_date` DATETIME,
  FOREIGN KEY (`maintenance_contract_company_id`) REFERENCES `Third_Party_Companies`(`company_id`)
)"#;

const ASSETS: &str = r#"CREATE TABLE `Assets` (
  `asset_id` INTEGER PRIMARY KEY,
  `maintenance_contract_id` INTEGER NOT NULL,
  `supplier_company_id` INTEGER NOT NULL,
  `asset_details` VARCHAR(255),
  `asset_make` VARCHAR(20),
  `asset_model` VARCHAR(20),
  `asset_acquired_date` DATETIME,
  `asset_disposed_date` DATETIME,
  FOREIGN KEY (`maintenance_contract_id`) REFERENCES `Maintenance_Contracts`(`maintenance_contract_id`),
  FOREIGN KEY (`supplier_company_id`) REFERENCES `Third_Party_Companies`(`company_id`)
)"#;

const FAULT_LOG: &str = r#"CREATE TABLE `Fault_Log` (
  `fault_log_entry_id` INTEGER PRIMARY KEY,
  `asset_id` INTEGER NOT NULL,
  `recorded_by_staff_id` INTEGER NOT NULL,
  `fault_log_entry_datetime` DATETIME,
  `fault_description` VARCHAR(255),
  FOREIGN KEY (`asset_id`) REFERENCES `Assets`(`asset_id`)
)"#;

const RECENT_FAULTS: &str = "SELECT a.asset_id, a.asset_details, COUNT(*) AS fault_count \
FROM Assets a JOIN Fault_Log f ON f.asset_id = a.asset_id \
WHERE f.fault_log_entry_datetime >= date('now', '-1 month') \
GROUP BY a.asset_id, a.asset_details";

const QUESTION: &str = "which assets had faults in the last month";

fn tables() -> Vec<TableInput> {
    vec![
        TableInput::new(THIRD_PARTY_COMPANIES)
            .with_aliases(split_list("vendors, suppliers"))
            .with_description("External companies that supply or service equipment")
            .with_keywords(split_list("vendor, supplier, contractor")),
        TableInput::new(MAINTENANCE_CONTRACTS)
            .with_aliases(split_list("contracts"))
            .with_description("Service contracts signed with third party companies")
            .with_keywords(split_list("contract, service, agreement")),
        TableInput::new(ASSETS)
            .with_aliases(split_list("equipment, machines"))
            .with_description("Physical equipment tracked for maintenance")
            .with_keywords(split_list("asset, equipment, machine")),
        TableInput::new(FAULT_LOG)
            .with_aliases(split_list("fault log, breakdowns"))
            .with_description("Faults reported against assets")
            .with_keywords(split_list("fault, breakdown, incident")),
    ]
}

fn recent_faults() -> ExampleInput {
    ExampleInput::new(RECENT_FAULTS)
        .with_description("Recent fault analysis for assets")
        .with_keywords(split_list("faults, assets, recent, maintenance"))
}

fn engine_with(mode: ReconcileMode, embedder: Arc<dyn Embedder>) -> Engine {
    let mut config = Config::default();
    config.embedding.dimension = DIMENSION;
    config.consistency.mode = mode;
    Engine::new(config, embedder).unwrap()
}

fn sync_engine() -> Engine {
    engine_with(ReconcileMode::Sync, Arc::new(HashEmbedder::new(DIMENSION)))
}

async fn load_fixture(engine: &Engine) {
    for input in tables() {
        assert_eq!(
            engine.upsert_table(DB, input).await.unwrap(),
            UpsertOutcome::Created
        );
    }
    engine.add_example(DB, recent_faults()).await.unwrap();
}

/// Hash embedder that can be switched off to simulate an outage
struct SwitchableEmbedder {
    inner: HashEmbedder,
    up: AtomicBool,
}

impl SwitchableEmbedder {
    fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIMENSION),
            up: AtomicBool::new(true),
        }
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for SwitchableEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(Error::EmbeddingUnavailable("connection refused".to_string()));
        }
        self.inner.embed(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[tokio::test]
async fn test_fault_question_ranks_fault_log_and_assets_first() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    assert_eq!(bundle.database(), DB);
    assert_eq!(bundle.question(), QUESTION);

    let fault_log = bundle.position_of("Fault_Log").unwrap();
    let assets = bundle.position_of("Assets").unwrap();
    assert!(fault_log < assets);
    if let Some(companies) = bundle.position_of("Third_Party_Companies") {
        assert!(companies > assets);
    }

    let examples = bundle.example_ids();
    assert_eq!(examples.len(), 1);
    let example = engine.get_example(DB, examples[0]).unwrap();
    assert_eq!(example.description, "Recent fault analysis for assets");
    assert_eq!(example.referenced_tables, vec!["Assets", "Fault_Log"]);

    // Assets is pulled up by its foreign key to the already selected Fault_Log
    let assets_entry = &bundle.entries()[assets];
    assert!(assets_entry.components.graph >= 1.0);
}

#[tokio::test]
async fn test_bundle_respects_budget() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    let bundle = engine.retrieve_with_budget(DB, QUESTION, 1100).await.unwrap();
    assert!(bundle.total_size() <= 1100);
    assert!(bundle.position_of("Fault_Log").is_some());
    assert!(bundle.position_of("Assets").is_some());
    assert!(bundle.position_of("Maintenance_Contracts").is_none());
    assert!(bundle.position_of("Third_Party_Companies").is_none());

    let mut running = 0;
    for entry in bundle.entries() {
        running += entry.size;
        assert_eq!(entry.cumulative_size, running);
        assert_eq!(entry.size, entry.item.size());
    }
}

#[tokio::test]
async fn test_tiny_budget_yields_empty_bundle() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    let bundle = engine.retrieve_with_budget(DB, QUESTION, 10).await.unwrap();
    assert!(bundle.is_empty());
    assert_eq!(bundle.total_size(), 0);
}

#[tokio::test]
async fn test_bundle_has_no_duplicates() {
    let engine = sync_engine();
    load_fixture(&engine).await;
    // Re-ingesting the same rows must not add entries
    load_fixture_again(&engine).await;

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    let mut names: Vec<&str> = bundle.entries().iter().map(|e| e.item.name()).collect();
    let total = names.len();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), total);
    assert_eq!(bundle.table_names().len(), 4);
    assert!(bundle.total_size() <= bundle.budget());
}

async fn load_fixture_again(engine: &Engine) {
    for input in tables() {
        assert_eq!(
            engine.upsert_table(DB, input).await.unwrap(),
            UpsertOutcome::Unchanged
        );
    }
    engine.add_example(DB, recent_faults()).await.unwrap();
    assert_eq!(engine.list_examples(DB).len(), 1);
}

#[tokio::test]
async fn test_unknown_database_has_no_schema() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    let err = engine.retrieve("payroll", QUESTION).await.unwrap_err();
    assert!(matches!(err, Error::NoSchemaIndexed(ref db) if db == "payroll"));
    assert!(err.is_no_results());
}

#[tokio::test]
async fn test_databases_are_isolated() {
    let engine = sync_engine();
    load_fixture(&engine).await;
    engine
        .upsert_table(
            "fleet",
            TableInput::new(
                "CREATE TABLE Vehicle_Faults (fault_id INTEGER PRIMARY KEY, asset_tag TEXT, reported_at DATETIME)",
            )
            .with_keywords(split_list("fault, asset")),
        )
        .await
        .unwrap();

    assert_eq!(engine.list_databases(), vec![DB, "fleet"]);

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    assert!(bundle.position_of("Vehicle_Faults").is_none());

    let fleet = engine.retrieve("fleet", QUESTION).await.unwrap();
    assert_eq!(fleet.table_names(), vec!["Vehicle_Faults"]);
    assert!(fleet.example_ids().is_empty());
}

#[tokio::test]
async fn test_reconcile_after_sync_writes_is_noop() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    for table in engine.list_tables(DB) {
        assert!(!table.is_stale(), "{} should be embedded", table.name);
    }
    let stats = engine.reconcile().await.unwrap();
    assert!(stats.is_noop());
}

#[tokio::test]
async fn test_ddl_change_is_reembedded() {
    let engine = sync_engine();
    load_fixture(&engine).await;
    let before = engine.get_table(DB, "fault_log").unwrap();
    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    let position = bundle.position_of("Fault_Log").unwrap();
    let similarity_before = bundle.entries()[position].components.vector;

    let changed = FAULT_LOG.replace(
        "`fault_description` VARCHAR(255),",
        "`fault_description` VARCHAR(255),\n  `fault_status` VARCHAR(10),",
    );
    let outcome = engine
        .upsert_table(
            DB,
            TableInput::new(changed)
                .with_aliases(split_list("fault log, breakdowns"))
                .with_description("Faults reported against assets")
                .with_keywords(split_list("fault, breakdown, incident")),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Changed);

    let after = engine.get_table(DB, "Fault_Log").unwrap();
    assert_ne!(after.ddl_hash, before.ddl_hash);
    assert!(!after.is_stale());
    assert_ne!(after.embedding, before.embedding);

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    let position = bundle.position_of("Fault_Log").unwrap();
    let entry = &bundle.entries()[position];
    match &entry.item {
        ContextItem::Table { ddl, .. } => assert!(ddl.contains("fault_status")),
        other => panic!("expected a table, got {:?}", other),
    }

    // ranked with the vector of the new DDL, not the one it replaced
    let question = HashEmbedder::new(DIMENSION)
        .embed(vec![QUESTION.to_string()])
        .await
        .unwrap()
        .remove(0);
    let expected = cosine_similarity(&question, after.embedding.as_deref().unwrap());
    assert!((entry.components.vector - expected).abs() < 1e-5);
    assert_ne!(entry.components.vector, similarity_before);
}

#[tokio::test]
async fn test_removed_table_leaves_bundle() {
    let engine = sync_engine();
    load_fixture(&engine).await;

    let removed = engine
        .remove_table(DB, "third_party_companies")
        .await
        .unwrap();
    assert_eq!(removed.name, "Third_Party_Companies");
    assert!(matches!(
        engine.get_table(DB, "Third_Party_Companies"),
        Err(Error::NotFound(_))
    ));

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    assert!(bundle.position_of("Third_Party_Companies").is_none());
    assert_eq!(bundle.table_names().len(), 3);
}

#[tokio::test]
async fn test_outage_keeps_items_queued() {
    let embedder = Arc::new(SwitchableEmbedder::new());
    let engine = engine_with(ReconcileMode::Sync, embedder.clone());
    embedder.set_up(false);

    let err = engine
        .upsert_table(DB, tables().remove(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    assert!(err.is_transient());

    let stored = engine.get_table(DB, "Fault_Log").unwrap();
    assert!(stored.is_stale());
    assert!(matches!(
        engine.retrieve(DB, QUESTION).await,
        Err(Error::NoSchemaIndexed(_))
    ));

    embedder.set_up(true);
    let stats = engine.reconcile().await.unwrap();
    assert_eq!(stats.tables_embedded, 1);

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    assert_eq!(bundle.table_names(), vec!["Fault_Log"]);
}

#[tokio::test]
async fn test_retrieval_fails_while_provider_is_down() {
    let embedder = Arc::new(SwitchableEmbedder::new());
    let engine = engine_with(ReconcileMode::Sync, embedder.clone());
    load_fixture(&engine).await;

    embedder.set_up(false);
    assert!(matches!(
        engine.retrieve(DB, QUESTION).await,
        Err(Error::EmbeddingUnavailable(_))
    ));
}

#[tokio::test]
async fn test_deferred_mode_waits_for_reconcile() {
    let engine = engine_with(
        ReconcileMode::Deferred,
        Arc::new(HashEmbedder::new(DIMENSION)),
    );
    load_fixture(&engine).await;

    assert!(engine.get_table(DB, "Assets").unwrap().is_stale());
    assert!(matches!(
        engine.retrieve(DB, QUESTION).await,
        Err(Error::NoSchemaIndexed(_))
    ));

    let stats = engine.reconcile().await.unwrap();
    assert_eq!(stats.tables_embedded, 4);
    assert_eq!(stats.examples_embedded, 1);
    assert_eq!(stats.superseded, 0);

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    assert!(bundle.position_of("Fault_Log").unwrap() < bundle.position_of("Assets").unwrap());
}

#[tokio::test]
async fn test_restore_from_store_reproduces_ranking() {
    let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());

    let first = sync_engine().with_store(Arc::clone(&store));
    first.init_store().await.unwrap();
    load_fixture(&first).await;
    let expected = first.retrieve(DB, QUESTION).await.unwrap();

    let second = sync_engine().with_store(Arc::clone(&store));
    let stats = second.restore().await.unwrap();
    assert_eq!(stats.tables, 4);
    assert_eq!(stats.examples, 1);
    assert_eq!(stats.stale, 0);
    assert_eq!(stats.skipped, 0);

    let restored = second.retrieve(DB, QUESTION).await.unwrap();
    let names = |b: &groundsql::ContextBundle| -> Vec<String> {
        b.entries().iter().map(|e| e.item.name().to_string()).collect()
    };
    assert_eq!(names(&restored), names(&expected));
    assert_eq!(second.foreign_key_edges(DB).len(), 4);
}

#[tokio::test]
async fn test_restore_with_other_dimension_requeues() {
    let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());

    let first = sync_engine().with_store(Arc::clone(&store));
    load_fixture(&first).await;

    let mut config = Config::default();
    config.embedding.dimension = 256;
    config.consistency.mode = ReconcileMode::Deferred;
    let second = Engine::new(config, Arc::new(HashEmbedder::new(256)))
        .unwrap()
        .with_store(Arc::clone(&store));

    let stats = second.restore().await.unwrap();
    assert_eq!(stats.stale, 5);
    assert!(engine_tables_stale(&second));

    let reconciled = second.reconcile().await.unwrap();
    assert_eq!(reconciled.tables_embedded, 4);
    assert_eq!(reconciled.examples_embedded, 1);
    assert_eq!(reconciled.persisted, 5);
    assert!(second.retrieve(DB, QUESTION).await.is_ok());
}

fn engine_tables_stale(engine: &Engine) -> bool {
    engine.list_tables(DB).iter().all(|t| t.is_stale())
}

#[tokio::test]
async fn test_database_descriptions_route_questions() {
    let engine = sync_engine();
    load_fixture(&engine).await;
    engine
        .set_database_info(
            DB,
            DatabaseInfoInput::new()
                .with_aliases(split_list("maintenance, upkeep"))
                .with_description("Assets, their service contracts and logged faults")
                .with_keywords(split_list("asset, fault, contract")),
        )
        .await
        .unwrap();
    engine
        .set_database_info(
            "payroll",
            DatabaseInfoInput::new()
                .with_description("Employee salaries and pay slips")
                .with_keywords(split_list("salary, wage, payslip")),
        )
        .await
        .unwrap();

    let ranked = engine.rank_databases(QUESTION).await.unwrap();
    let names: Vec<&str> = ranked.iter().map(|m| m.database.as_str()).collect();
    assert_eq!(names, vec![DB, "payroll"]);
    assert!(ranked[0].components.keyword > 0.0);
    assert_eq!(ranked[1].components.keyword, 0.0);

    let ranked = engine.rank_databases("monthly salary per employee").await.unwrap();
    assert_eq!(ranked[0].database, "payroll");

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    let info = bundle.database_info().unwrap();
    assert_eq!(info.description, "Assets, their service contracts and logged faults");
    assert_eq!(engine.list_databases(), vec![DB, "payroll"]);
}

#[tokio::test]
async fn test_column_details_reach_the_bundle() {
    let engine = sync_engine();
    load_fixture(&engine).await;
    let before = engine.get_table(DB, "Fault_Log").unwrap();

    engine
        .update_table_details(
            DB,
            "Fault_Log",
            vec![ColumnDetailInput::new("fault_log_entry_datetime")
                .with_aliases(split_list("reported at, logged on"))
                .with_description("When the fault was logged")
                .with_keywords(split_list("month, date"))],
        )
        .await
        .unwrap();

    let after = engine.get_table(DB, "Fault_Log").unwrap();
    assert!(!after.is_stale());
    assert_ne!(after.embedding, before.embedding);
    assert_eq!(after.ddl_hash, before.ddl_hash);

    let bundle = engine.retrieve(DB, QUESTION).await.unwrap();
    let entry = &bundle.entries()[bundle.position_of("Fault_Log").unwrap()];
    match &entry.item {
        ContextItem::Table { columns, .. } => {
            assert_eq!(columns.len(), 1);
            assert_eq!(columns[0].data_type, "DATETIME");
        }
        other => panic!("expected a table, got {:?}", other),
    }
    let examples = engine.list_examples_for_table(DB, "fault_log");
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].description, "Recent fault analysis for assets");
}
