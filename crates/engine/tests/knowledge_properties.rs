use lorebook_engine::{
    EngineConfig, EntryId, Error, HashingEmbedder, IndexKind, KnowledgeEngine, KnowledgeStore,
    DOCUMENT_CHUNK,
};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with_dim(dim: usize) -> KnowledgeEngine {
    let store = KnowledgeStore::open_in_memory(IndexKind::Exact).unwrap();
    KnowledgeEngine::new(store, Box::new(HashingEmbedder::new(dim).unwrap())).unwrap()
}

fn seed(engine: &KnowledgeEngine) -> Vec<EntryId> {
    vec![
        engine.add_setting("character", "Alice is a warrior").unwrap(),
        engine.add_setting("character", "Bram is a cartographer from the north").unwrap(),
        engine.add_setting("world", "The kingdom of Eldor").unwrap(),
        engine.add_setting("plot", "The moons of Eldor align once a century").unwrap(),
    ]
}

fn ids(hits: &[(lorebook_engine::KnowledgeEntry, f32)]) -> Vec<EntryId> {
    hits.iter().map(|(e, _)| e.id).collect()
}

#[test]
fn restore_of_backup_is_idempotent() -> anyhow::Result<()> {
    init_tracing();
    let engine = engine_with_dim(384);
    seed(&engine);
    engine.add_document(&"lorem ipsum dolor sit amet ".repeat(20), 100, 20)?;

    let before_stats = engine.stats()?;
    let before_hits = engine.query("warrior of Eldor", 4)?;

    let blob = engine.backup()?;
    engine.restore(&blob)?;

    assert_eq!(engine.stats()?, before_stats);
    let after_hits = engine.query("warrior of Eldor", 4)?;
    assert_eq!(ids(&after_hits), ids(&before_hits));
    for ((_, a), (_, b)) in before_hits.iter().zip(&after_hits) {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn counts_agree_after_mixed_mutations() -> anyhow::Result<()> {
    let engine = engine_with_dim(64);
    let seeded = seed(&engine);
    let doc = engine.add_document(&"abcdefghij".repeat(30), 50, 10)?;
    engine.delete(seeded[1])?;
    engine.delete(doc[0])?;
    engine.delete(EntryId(9_999))?;
    engine.add_setting("world", "A second continent")?;

    let stats = engine.stats()?;
    let listed = engine.list(None)?;
    assert_eq!(stats.total_count, listed.len());
    assert_eq!(stats.total_count, engine.vector_count()?);
    assert_eq!(
        stats.counts_by_type.values().sum::<usize>(),
        stats.total_count
    );
    assert_eq!(stats.counts_by_type[DOCUMENT_CHUNK], doc.len() - 1);
    Ok(())
}

#[test]
fn exact_content_is_its_own_top_hit() -> anyhow::Result<()> {
    let engine = engine_with_dim(384);
    let seeded = seed(&engine);
    let contents = [
        "Alice is a warrior",
        "Bram is a cartographer from the north",
        "The kingdom of Eldor",
        "The moons of Eldor align once a century",
    ];
    for (id, content) in seeded.iter().zip(contents) {
        let hits = engine.query(content, 4)?;
        assert_eq!(hits[0].0.id, *id, "query {content:?}");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
    }
    Ok(())
}

#[test]
fn deleted_entries_never_come_back() -> anyhow::Result<()> {
    let engine = engine_with_dim(384);
    let alice = engine.add_setting("character", "Alice is a warrior")?;
    engine.add_setting("world", "The kingdom of Eldor")?;

    assert!(engine.delete(alice)?);
    let hits = engine.query("Alice is a warrior", 10)?;
    assert!(hits.iter().all(|(e, _)| e.id != alice));

    let again = engine.add_setting("character", "Alice is a warrior")?;
    assert_ne!(again, alice);
    assert_eq!(engine.query("Alice is a warrior", 1)?[0].0.id, again);
    Ok(())
}

#[test]
fn warrior_query_finds_alice() {
    let engine = engine_with_dim(384);
    let alice = engine.add_setting("character", "Alice is a warrior").unwrap();
    engine.add_setting("world", "The kingdom of Eldor").unwrap();
    let hits = engine.query("warrior princess", 1).unwrap();
    assert_eq!(hits[0].0.id, alice);
}

#[test]
fn restore_with_other_dimension_is_rejected_and_harmless() {
    let source = engine_with_dim(384);
    seed(&source);
    let blob = source.backup().unwrap();

    let target = engine_with_dim(768);
    let kept = target.add_setting("world", "Mirel, the drowned city").unwrap();
    let before = target.stats().unwrap();

    assert!(matches!(
        target.restore(&blob),
        Err(Error::IncompatibleBackup(_))
    ));
    assert_eq!(target.stats().unwrap(), before);
    assert_eq!(
        target.get(kept).unwrap().content,
        "Mirel, the drowned city"
    );
}

#[test]
fn restore_rejects_unknown_versions_and_garbage() {
    let engine = engine_with_dim(16);
    seed(&engine);
    let before = engine.stats().unwrap();

    let mut blob: serde_json::Value = serde_json::from_slice(&engine.backup().unwrap()).unwrap();
    blob["version"] = serde_json::json!(7);
    let future = serde_json::to_vec(&blob).unwrap();
    assert!(matches!(
        engine.restore(&future),
        Err(Error::UnsupportedBackupVersion(7))
    ));
    assert!(matches!(
        engine.restore(b"not a backup"),
        Err(Error::CorruptBackup(_))
    ));
    assert_eq!(engine.stats().unwrap(), before);
}

#[test]
fn ids_keep_increasing_after_clear_and_restore() -> anyhow::Result<()> {
    let engine = engine_with_dim(32);
    let seeded = seed(&engine);
    let blob = engine.backup()?;
    let max_seeded = *seeded.iter().max().unwrap();

    engine.clear()?;
    let after_clear = engine.add_setting("plot", "A new beginning")?;
    assert!(after_clear > max_seeded);

    engine.restore(&blob)?;
    let after_restore = engine.add_setting("plot", "Another chapter")?;
    assert!(after_restore > after_clear);
    Ok(())
}

#[test]
fn durable_across_reopen() -> anyhow::Result<()> {
    let file = NamedTempFile::new()?;
    let config = EngineConfig {
        db_path: Some(file.path().to_path_buf()),
        ..EngineConfig::default()
    };

    let alice = {
        let engine = KnowledgeEngine::open(&config)?;
        let alice = engine.add_setting("character", "Alice is a warrior")?;
        engine.add_setting("world", "The kingdom of Eldor")?;
        engine.close();
        alice
    };

    let engine = KnowledgeEngine::open(&config)?;
    assert_eq!(engine.stats()?.total_count, 2);
    assert_eq!(engine.query("warrior princess", 1)?[0].0.id, alice);
    let next = engine.add_setting("plot", "Alice leaves Eldor")?;
    assert!(next > alice);
    Ok(())
}

#[test]
fn readers_and_writers_share_one_engine() {
    let engine = Arc::new(engine_with_dim(128));
    seed(&engine);

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..25 {
                    let id = engine
                        .add_setting("plot", &format!("writer {w} event {i}"))
                        .unwrap();
                    if i % 5 == 0 {
                        engine.delete(id).unwrap();
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..50 {
                    let hits = engine.query("event", 5).unwrap();
                    assert!(hits.len() <= 5);
                    for (entry, _) in &hits {
                        assert!(!entry.content.is_empty());
                    }
                    let stats = engine.stats().unwrap();
                    assert_eq!(
                        stats.counts_by_type.values().sum::<usize>(),
                        stats.total_count
                    );
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.total_count, 4 + 2 * 20);
    assert_eq!(stats.total_count, engine.vector_count().unwrap());
}

#[cfg(feature = "hnsw")]
#[test]
fn hnsw_index_agrees_with_exact_on_top_hit() {
    let exact = engine_with_dim(384);
    let store = KnowledgeStore::open_in_memory(IndexKind::Hnsw).unwrap();
    let approx = KnowledgeEngine::new(store, Box::new(HashingEmbedder::default())).unwrap();

    for i in 0..100 {
        let text = format!("setting number {i} about the realm of {}", i * 7 % 13);
        exact.add_setting("world", &text).unwrap();
        approx.add_setting("world", &text).unwrap();
    }
    for q in ["setting number 42 about the realm of 8", "setting number 7"] {
        assert_eq!(
            exact.query(q, 1).unwrap()[0].0.id,
            approx.query(q, 1).unwrap()[0].0.id,
            "query {q:?}"
        );
    }
}
