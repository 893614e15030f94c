//! World-level persistence: mutation storms converge to the latest state on
//! disk, and a reopened world sees exactly what was written.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use worldsave_core::{Config, Record};
use worldsave_storage::{DirCacheHandle, StoreOptions, World, temp_path_for};

fn config_for(root: &std::path::Path) -> Config {
    Config {
        storage_root: root.to_path_buf(),
        save_delay_ms: 15,
        save_cooldown_ms: 15,
        rename_attempts: 3,
        rename_backoff_ms: 1,
        rename_retry_enabled: true,
    }
}

#[test]
fn storm_of_mutations_lands_latest_state() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(tmp.path());
    let opts = StoreOptions::from_config(&config).with_dirs(DirCacheHandle::isolated());
    let world = Arc::new(World::open_with(tmp.path(), &opts).unwrap());

    for i in 0..4 {
        world.agents.create(&format!("agent-{i}")).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let id = format!("agent-{i}");
                for n in 0..100 {
                    world
                        .agents
                        .update(&id, |a| a.persona = format!("step {n}"))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(world.flush_all(Duration::from_secs(10)));

    let stats = world.stats();
    let agents = &stats.stores["agents"];
    assert_eq!(agents.requests, 404);
    assert!(agents.flushes < 404, "writes were not coalesced: {agents:?}");

    for i in 0..4 {
        let path = world.agents.path_for(&format!("agent-{i}"));
        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["persona"], "step 99");
        assert!(!temp_path_for(&path).exists());
    }
}

#[test]
fn reopen_sees_every_kind() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(tmp.path());
    {
        let world = World::open(&config).unwrap();
        world.users.create("ada").unwrap();
        world
            .users
            .update("ada", |u| u.agent_ids.push("agent-1".into()))
            .unwrap();
        world.locations.create("library").unwrap();
        world.gimmicks.create("clock").unwrap();
        world
            .gimmicks
            .update("clock", |g| g.state = serde_json::json!({"hour": 7}))
            .unwrap();
        assert!(world.flush_all(Duration::from_secs(10)));
    }

    let world = World::open(&config).unwrap();
    let ada = world.users.get("ada").unwrap();
    assert_eq!(ada.id(), "ada");
    assert_eq!(ada.agent_ids, vec!["agent-1".to_string()]);
    assert_eq!(world.gimmicks.get("clock").unwrap().state["hour"], 7);
    assert_eq!(world.ids_of("locations").unwrap(), vec!["library".to_string()]);
    assert!(world.agents.is_empty());
}
