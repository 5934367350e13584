use super::*;
use crate::config::Config;
use crate::error::MonoError;
use crate::table::{ColumnInfo, DataType, DefaultExpr, Row, TableInfo, Value};
use crate::types::RowId;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

fn file_config(dir: &Path) -> Config {
	Config {
		large_object_threshold: 64,
		cell_cache_entries: 256,
		..Config::with_data_dir(dir)
	}
}

fn notes() -> TableInfo {
	TableInfo::new(
		"notes",
		vec![
			ColumnInfo::new("id", DataType::BigInt),
			ColumnInfo::new("body", DataType::Text),
			ColumnInfo::new("extra", DataType::Text),
		],
	)
}

fn with_rows(db: &Arc<Conglomerate>, info: TableInfo, count: i64) {
	let name = info.name.clone();
	let mut txn = db.begin_transaction().unwrap();
	txn.create_table(info, false).unwrap();
	{
		let mut table = txn.get_table(&name).unwrap();
		for id in 0..count {
			table
				.add_row(vec![Value::Integer(id), Value::from(format!("note {}", id)), Value::Null])
				.unwrap();
		}
	}
	txn.commit().unwrap();
}

fn all_rows(txn: &mut Transaction, name: &str) -> Vec<Row> {
	txn.select_table(name)
		.unwrap()
		.rows()
		.unwrap()
		.into_iter()
		.map(|(_, row)| row)
		.collect()
}

#[test]
fn test_round_trip_survives_reopen() {
	init_tracing();
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	assert!(!Conglomerate::exists(&config).unwrap());

	let db = Conglomerate::create(config.clone()).unwrap();
	let mut txn = db.begin_transaction().unwrap();
	txn.create_table(notes(), false).unwrap();
	txn.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(42), Value::from("hello"), Value::Null])
		.unwrap();
	assert_eq!(
		all_rows(&mut txn, "notes"),
		vec![vec![Value::Integer(42), Value::from("hello"), Value::Null]]
	);
	txn.commit().unwrap();
	db.close().unwrap();

	assert!(Conglomerate::exists(&config).unwrap());
	assert!(matches!(
		Conglomerate::create(config.clone()),
		Err(MonoError::AlreadyExists(_))
	));

	let db = Conglomerate::open(config).unwrap();
	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(
		all_rows(&mut txn, "notes"),
		vec![vec![Value::Integer(42), Value::from("hello"), Value::Null]]
	);
	txn.rollback().unwrap();
	db.close().unwrap();
}

#[test]
fn test_concurrent_remove_conflicts() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 10);

	let mut first = db.begin_transaction().unwrap();
	let mut second = db.begin_transaction().unwrap();
	first.get_table("notes").unwrap().remove_row(RowId(7)).unwrap();
	second.get_table("notes").unwrap().remove_row(RowId(7)).unwrap();

	first.commit().unwrap();
	let err = second.commit().unwrap_err();
	assert!(matches!(err, MonoError::CommitConflict(_)));
	assert!(err.is_retryable());

	let mut txn = db.begin_transaction().unwrap();
	let view = txn.select_table("notes").unwrap();
	assert_eq!(view.row_count(), 9);
	assert!(!view.contains(RowId(7)));
	drop(view);
	txn.rollback().unwrap();
	assert_eq!(db.open_transaction_count(), 0);
}

#[test]
fn test_disjoint_changes_both_commit() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 4);

	let mut first = db.begin_transaction().unwrap();
	let mut second = db.begin_transaction().unwrap();
	first.get_table("notes").unwrap().remove_row(RowId(1)).unwrap();
	second.get_table("notes").unwrap().remove_row(RowId(2)).unwrap();
	second
		.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(9), Value::Null, Value::Null])
		.unwrap();

	let a = first.commit().unwrap();
	let b = second.commit().unwrap();
	assert!(b > a);

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 3);
}

#[test]
fn test_snapshot_isolation() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 2);

	let mut writer = db.begin_transaction().unwrap();
	let mut reader = db.begin_transaction().unwrap();
	let added = writer
		.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(3), Value::from("draft"), Value::Null])
		.unwrap();
	writer.create_table(TableInfo::new("drafts", notes().columns), false).unwrap();

	// Own writes are visible at once, other transactions' are not
	assert!(writer.select_table("notes").unwrap().contains(added));
	assert!(!reader.select_table("notes").unwrap().contains(added));

	writer.commit().unwrap();
	assert!(!reader.select_table("notes").unwrap().contains(added));
	assert_eq!(reader.select_table("notes").unwrap().row_count(), 2);
	assert!(!reader.table_exists("drafts"));
	reader.commit().unwrap();

	let mut late = db.begin_transaction().unwrap();
	assert!(late.select_table("notes").unwrap().contains(added));
	assert!(late.table_exists("drafts"));
}

#[test]
fn test_concurrent_create_same_name() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	let mut first = db.begin_transaction().unwrap();
	let mut second = db.begin_transaction().unwrap();
	first.create_table(notes(), false).unwrap();
	second.create_table(notes(), false).unwrap();

	first.commit().unwrap();
	assert!(matches!(
		second.commit(),
		Err(MonoError::CommitConflict(_))
	));
	assert_eq!(db.visible_tables().len(), 1);
	assert!(db.pending_delete_tables().is_empty());
}

#[test]
fn test_drop_of_modified_table_conflicts() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 3);

	let mut dropper = db.begin_transaction().unwrap();
	let mut writer = db.begin_transaction().unwrap();
	writer.get_table("notes").unwrap().remove_row(RowId(0)).unwrap();
	writer.commit().unwrap();

	dropper.drop_table("notes").unwrap();
	assert!(matches!(
		dropper.commit(),
		Err(MonoError::CommitConflict(_))
	));

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 2);
	txn.drop_table("notes").unwrap();
	txn.commit().unwrap();
	assert!(db.visible_tables().is_empty());
	assert!(db.pending_delete_tables().is_empty());
}

#[test]
fn test_unique_key_checked_at_commit() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	let info = TableInfo::new(
		"accounts",
		vec![
			ColumnInfo::new("email", DataType::Varchar(64)).unique(),
			ColumnInfo::new("balance", DataType::BigInt),
		],
	);
	let mut txn = db.begin_transaction().unwrap();
	txn.create_table(info, false).unwrap();
	txn.commit().unwrap();

	let mut first = db.begin_transaction().unwrap();
	let mut second = db.begin_transaction().unwrap();
	for txn in [&mut first, &mut second] {
		txn.get_table("accounts")
			.unwrap()
			.add_row(vec![Value::from("a@example.com"), Value::Integer(0)])
			.unwrap();
	}
	first.commit().unwrap();
	assert!(matches!(second.commit(), Err(MonoError::Constraint(_))));

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("accounts").unwrap().row_count(), 1);
}

#[test]
fn test_alter_with_default_survives_reopen() {
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let db = Conglomerate::create(config.clone()).unwrap();
	with_rows(&db, notes(), 2);

	let mut altered = notes();
	altered.columns.push(
		ColumnInfo::new("status", DataType::Varchar(16))
			.not_null()
			.default_value(DefaultExpr::Literal(Value::from("new"))),
	);
	let mut txn = db.begin_transaction().unwrap();
	txn.alter_table(altered.clone()).unwrap();
	txn.commit().unwrap();
	db.close().unwrap();

	let db = Conglomerate::open(config).unwrap();
	assert_eq!(db.visible_tables().len(), 1);
	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.table_info("notes").unwrap(), altered);
	let mut rows = all_rows(&mut txn, "notes");
	rows.sort();
	assert_eq!(
		rows,
		vec![
			vec![Value::Integer(0), Value::from("note 0"), Value::Null, Value::from("new")],
			vec![Value::Integer(1), Value::from("note 1"), Value::Null, Value::from("new")],
		]
	);
}

#[test]
fn test_sequence_continues_after_alter() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	let info = TableInfo::new(
		"tickets",
		vec![
			ColumnInfo::new("id", DataType::BigInt)
				.primary_key()
				.default_value(DefaultExpr::NextSequence),
			ColumnInfo::new("title", DataType::Text),
		],
	);
	let mut txn = db.begin_transaction().unwrap();
	txn.create_table(info.clone(), false).unwrap();
	for title in ["a", "b"] {
		txn.get_table("tickets")
			.unwrap()
			.add_named_row(&[("title", Value::from(title))])
			.unwrap();
	}
	txn.commit().unwrap();

	let mut altered = info;
	altered
		.columns
		.push(ColumnInfo::new("opened", DataType::Timestamp).default_value(DefaultExpr::CurrentTimestamp));
	let mut txn = db.begin_transaction().unwrap();
	txn.alter_table(altered).unwrap();
	let row = txn
		.get_table("tickets")
		.unwrap()
		.add_named_row(&[("title", Value::from("c"))])
		.unwrap();
	let view = txn.select_table("tickets").unwrap();
	assert_eq!(view.get_value(row, 0).unwrap(), Value::Integer(3));
	assert!(matches!(view.get_value(row, 2).unwrap(), Value::Timestamp(_)));
}

#[test]
fn test_crash_before_commit_recovers_catalog() {
	init_tracing();
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let db = Conglomerate::create(config.clone()).unwrap();
	with_rows(&db, notes(), 3);

	let mut txn = db.begin_transaction().unwrap();
	let lost = txn
		.create_table(TableInfo::new("lost", notes().columns), false)
		.unwrap();
	txn.get_table("lost")
		.unwrap()
		.add_row(vec![Value::Integer(1), Value::Null, Value::Null])
		.unwrap();
	let lost_store = dir.path().join(format!("lost_{}.mds", lost.0));
	assert!(lost_store.exists());
	assert_eq!(db.pending_delete_tables().len(), 1);

	// Simulate a crash: the transaction never finishes and nothing is closed
	std::mem::forget(txn);
	drop(db);

	let db = Conglomerate::open(config).unwrap();
	let visible: Vec<String> = db.visible_tables().into_iter().map(|t| t.name).collect();
	assert_eq!(visible, vec!["notes_1".to_string()]);
	assert!(db.pending_delete_tables().is_empty());
	assert!(!lost_store.exists());

	let mut txn = db.begin_transaction().unwrap();
	assert!(!txn.table_exists("lost"));
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 3);
	txn.commit().unwrap();
	db.close().unwrap();
}

#[test]
fn test_failed_commit_publishes_nothing() {
	init_tracing();
	let dir = tempdir().unwrap();
	let data = dir.path().join("data");
	let db = Conglomerate::create(file_config(&data)).unwrap();
	with_rows(&db, notes(), 1);
	let before = db.commit_id();
	let source = db.table_source(db.visible_tables()[0].id).unwrap();

	let mut txn = db.begin_transaction().unwrap();
	txn.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(99), "lost".into(), Value::Null])
		.unwrap();
	std::fs::remove_dir_all(&data).unwrap();
	assert!(matches!(txn.commit(), Err(MonoError::Io(_))));
	assert_eq!(db.commit_id(), before);

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 1);
	// A dropped table's own changes are still undone when the catalog
	// cannot be written
	txn.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(100), "also lost".into(), Value::Null])
		.unwrap();
	txn.drop_table("notes").unwrap();
	assert!(txn.commit().is_err());

	assert_eq!(db.commit_id(), before);
	assert_eq!(db.visible_tables().len(), 1);
	assert!(db.pending_delete_tables().is_empty());
	let stats = source.stats();
	assert_eq!(stats.committed, 1);
	assert_eq!(stats.uncommitted, 0);
	assert_eq!(stats.removed, 0);

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(
		all_rows(&mut txn, "notes"),
		vec![vec![Value::Integer(0), Value::from("note 0"), Value::Null]]
	);
	txn.rollback().unwrap();
}

#[test]
fn test_missing_visible_store_is_reported() {
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let db = Conglomerate::create(config.clone()).unwrap();
	with_rows(&db, notes(), 1);
	db.close().unwrap();

	std::fs::remove_file(dir.path().join("notes_1.mds")).unwrap();
	assert!(matches!(
		Conglomerate::open(config),
		Err(MonoError::NotFound(_))
	));
}

#[test]
fn test_large_objects_across_reopen() {
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let body = "lorem ipsum ".repeat(40);

	let db = Conglomerate::create(config.clone()).unwrap();
	let mut txn = db.begin_transaction().unwrap();
	txn.create_table(notes(), false).unwrap();
	txn.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(1), Value::from(body.as_str()), Value::from("short")])
		.unwrap();
	txn.commit().unwrap();
	assert_eq!(db.blob_store().store().all_areas().len(), 1);
	db.close().unwrap();

	let db = Conglomerate::open(config).unwrap();
	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(
		all_rows(&mut txn, "notes"),
		vec![vec![Value::Integer(1), Value::from(body.as_str()), Value::from("short")]]
	);
	let row = txn.select_table("notes").unwrap().row_ids()[0];
	txn.get_table("notes").unwrap().remove_row(row).unwrap();
	txn.commit().unwrap();

	// No transaction is open, so the row and its large object are reclaimed
	assert!(db.blob_store().store().all_areas().is_empty());
	db.close().unwrap();
}

#[test]
fn test_large_object_without_record_freed_on_open() {
	init_tracing();
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let table_path = dir.path().join("notes_1.mds");

	let db = Conglomerate::create(config.clone()).unwrap();
	with_rows(&db, notes(), 1);
	let before = std::fs::read(&table_path).unwrap();

	let mut txn = db.begin_transaction().unwrap();
	txn.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(1), Value::from("long body ".repeat(20)), Value::Null])
		.unwrap();
	txn.commit().unwrap();
	assert_eq!(db.blob_store().store().all_areas().len(), 1);

	// Crash with the large object durable but the table image one commit behind
	drop(db);
	std::fs::write(&table_path, before).unwrap();

	let db = Conglomerate::open(config).unwrap();
	assert!(db.blob_store().store().all_areas().is_empty());
	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 1);
	txn.commit().unwrap();
	db.close().unwrap();
}

#[test]
fn test_root_lock_defers_reclamation() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 5);
	let source = db.table_source(db.visible_tables()[0].id).unwrap();

	let lock = source.root_lock();
	let mut txn = db.begin_transaction().unwrap();
	txn.get_table("notes").unwrap().remove_row(RowId(2)).unwrap();
	txn.commit().unwrap();

	assert_eq!(source.pending_reclaim(), 1);
	assert!(source.free_rows().unwrap().is_empty());

	drop(lock);
	assert_eq!(source.pending_reclaim(), 0);
	assert_eq!(source.free_rows().unwrap(), vec![RowId(2)]);
}

#[test]
fn test_open_transaction_defers_reclamation() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 3);
	let source = db.table_source(db.visible_tables()[0].id).unwrap();

	let mut reader = db.begin_transaction().unwrap();
	let mut txn = db.begin_transaction().unwrap();
	txn.get_table("notes").unwrap().remove_row(RowId(0)).unwrap();
	txn.commit().unwrap();

	// The reader still sees the removed row
	assert_eq!(source.pending_reclaim(), 1);
	assert_eq!(
		reader.select_table("notes").unwrap().get_value(RowId(0), 1).unwrap(),
		Value::from("note 0")
	);
	reader.rollback().unwrap();
	assert_eq!(source.pending_reclaim(), 0);
}

#[test]
fn test_free_list_after_reopen() {
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let db = Conglomerate::create(config.clone()).unwrap();
	with_rows(&db, notes(), 20);

	let mut txn = db.begin_transaction().unwrap();
	{
		let mut table = txn.get_table("notes").unwrap();
		for row in [1, 4, 5, 9, 12, 17, 19] {
			table.remove_row(RowId(row)).unwrap();
		}
	}
	txn.commit().unwrap();
	db.close().unwrap();

	let db = Conglomerate::open(config).unwrap();
	let source = db.table_source(db.visible_tables()[0].id).unwrap();
	let free = source.free_rows().unwrap();
	let unique: HashSet<RowId> = free.iter().copied().collect();
	assert_eq!(free.len(), 7);
	assert_eq!(unique.len(), 7);

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 13);
	// New rows reuse freed slots
	let row = txn
		.get_table("notes")
		.unwrap()
		.add_row(vec![Value::Integer(99), Value::Null, Value::Null])
		.unwrap();
	assert!(unique.contains(&row));
}

#[test]
fn test_temporary_table_is_not_persisted() {
	let dir = tempdir().unwrap();
	let config = file_config(dir.path());
	let db = Conglomerate::create(config.clone()).unwrap();
	let mut txn = db.begin_transaction().unwrap();
	let id = txn.create_table(TableInfo::new("scratch", notes().columns), true).unwrap();
	txn.get_table("scratch")
		.unwrap()
		.add_row(vec![Value::Integer(1), Value::Null, Value::Null])
		.unwrap();
	txn.commit().unwrap();
	assert!(db.is_temporary(id));

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("scratch").unwrap().row_count(), 1);
	txn.commit().unwrap();
	db.close().unwrap();

	let db = Conglomerate::open(config).unwrap();
	assert!(db.visible_tables().is_empty());
}

#[test]
fn test_dropped_transaction_rolls_back() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 1);
	{
		let mut txn = db.begin_transaction().unwrap();
		txn.get_table("notes")
			.unwrap()
			.add_row(vec![Value::Integer(2), Value::Null, Value::Null])
			.unwrap();
		txn.create_table(TableInfo::new("other", notes().columns), false).unwrap();
		assert_eq!(db.open_transaction_count(), 1);
	}
	assert_eq!(db.open_transaction_count(), 0);
	assert!(db.pending_delete_tables().is_empty());

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 1);
	assert!(!txn.table_exists("other"));
	assert!(matches!(db.close(), Err(MonoError::Transaction(_))));
}

#[test]
fn test_parallel_inserts() {
	let db = Conglomerate::create(Config::in_memory()).unwrap();
	with_rows(&db, notes(), 0);

	let handles: Vec<_> = (0..4)
		.map(|worker| {
			let db = Arc::clone(&db);
			thread::spawn(move || {
				for batch in 0..5 {
					let mut txn = db.begin_transaction().unwrap();
					{
						let mut table = txn.get_table("notes").unwrap();
						for i in 0..10 {
							let id = worker * 1000 + batch * 10 + i;
							table.add_row(vec![Value::Integer(id), Value::Null, Value::Null]).unwrap();
						}
					}
					txn.commit().unwrap();
				}
			})
		})
		.collect();
	for handle in handles {
		handle.join().unwrap();
	}

	let mut txn = db.begin_transaction().unwrap();
	assert_eq!(txn.select_table("notes").unwrap().row_count(), 200);
	assert_eq!(db.commit_id().0, 21);
}
