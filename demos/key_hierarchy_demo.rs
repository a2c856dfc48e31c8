//! Minimal example: an encrypted dataset tree in memory.
//!
//! Demonstrates encryption roots, key inheritance, unload/load and batch
//! loading, with the audit log persisted to a file.
//! Run with: `cargo run --example key_hierarchy_demo`
//!
//! Key material comes from a key file and from a scripted "terminal", so
//! the demo runs unattended.

use std::fs;

use keyroot::store::PropertyStore;
use keyroot::{
    EncryptionSuite, KeyConfig, KeyFormat, KeyLocation, KeyManager, KeySource, MemoryPool,
    RequestedProps, ScriptedInput,
};

type DemoResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Decide the dataset's encryption and create it in the pool.
fn create(
    keys: &mut KeyManager<MemoryPool>,
    name: &str,
    request: RequestedProps,
) -> DemoResult<()> {
    let params = keys.create(name, &request)?;
    keys.pool_mut()
        .add_dataset(name, &params)
        .map_err(|status| format!("creating {name}: {status}"))?;
    Ok(())
}

fn main() -> DemoResult<()> {
    // 1. Setup
    let dir = std::env::temp_dir().join("keyroot_demo");
    fs::create_dir_all(&dir)?;

    let key_file = dir.join("projects.key");
    fs::write(&key_file, hex::encode(keyroot::generate_raw_key()?))?;

    let config = KeyConfig {
        audit_log: Some(dir.join("audit.jsonl")),
        ..KeyConfig::default()
    };

    // Someone at a terminal: sets the passphrase twice, then mistypes it
    // once on load.
    let typed = [
        "home passphrase",
        "home passphrase",
        "home passfrase",
        "home passphrase",
    ];
    let source = KeySource::with_prompt(ScriptedInput::interactive(typed));
    let mut keys = KeyManager::from_config(MemoryPool::new(), source, config)?;

    // 2. Build the tree
    create(&mut keys, "tank", RequestedProps::new())?;
    create(
        &mut keys,
        "tank/home",
        RequestedProps::new()
            .encryption(EncryptionSuite::DEFAULT)
            .keyformat(KeyFormat::Passphrase),
    )?;
    create(&mut keys, "tank/home/alice", RequestedProps::new())?;
    create(
        &mut keys,
        "tank/projects",
        RequestedProps::new()
            .encryption(EncryptionSuite::Aes256Gcm)
            .keyformat(KeyFormat::Hex)
            .keylocation(format!("file://{}", key_file.display()).parse::<KeyLocation>()?),
    )?;

    for dataset in ["tank", "tank/home", "tank/home/alice", "tank/projects"] {
        let props = keys.pool().crypto_props(dataset)?;
        let root = match (props.is_encryption_root(), props.inherited_root()) {
            (true, _) => "encryption root".to_string(),
            (false, Some(root)) => format!("inherits key from {root}"),
            (false, None) => "unencrypted".to_string(),
        };
        println!("{dataset:<18} {:<12} {root}", props.encryption.to_string());
    }

    // 3. Lock everything, then unlock
    keys.unload_key("tank/home")?;
    keys.unload_key("tank/projects")?;
    println!("Keys unloaded");

    let summary = keys.attempt_load_all("tank/projects")?;
    println!(
        "{} / {} keys successfully loaded",
        summary.loaded(),
        summary.attempted
    );

    // The mistyped passphrase costs one retry.
    keys.load_key("tank/home", false, None)?;

    // 4. Audit log
    println!("\nAudit log ({} records):", keys.audit_log().len());
    for record in keys.audit_log().iter() {
        println!(
            "  {} {:?} attempts={}",
            record.dataset, record.event, record.attempts
        );
    }
    println!("Persisted to {}", dir.join("audit.jsonl").display());

    Ok(())
}
