//! Integration tests for fieldseal with FileKeyProvider.

use fieldseal::codec::{FieldCodec, FieldKind};
use fieldseal::context::FieldScope;
use fieldseal::key_provider::Keyring;
use fieldseal::lookup::LookupService;
use fieldseal::migrate::Migrator;
use fieldseal::store::{FieldStore, MemoryStore};
use fieldseal_key_file::FileKeyProvider;
use std::sync::Arc;
use tempfile::TempDir;

fn keyring_in(dir: &TempDir) -> Keyring {
    let provider = FileKeyProvider::init(dir.path()).expect("Failed to initialize keys");
    Keyring::from_provider(&provider).expect("Failed to load keys")
}

#[test]
fn test_end_to_end_encryption_with_file_provider() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let codec = FieldCodec::new(&keyring_in(&temp_dir), FieldKind::Email).expect("codec");

    let sealed = codec.encode("alice@example.com").expect("Encryption failed");
    let decrypted = codec.decode(sealed.ciphertext()).expect("Decryption failed");

    assert_eq!(decrypted, "alice@example.com");
}

#[test]
fn test_keys_survive_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let first = FieldCodec::new(&keyring_in(&temp_dir), FieldKind::Email).expect("codec");
    let sealed = first.encode("alice@example.com").expect("encode");

    // Reload from disk as a new process would
    let provider = FileKeyProvider::new(temp_dir.path()).expect("provider");
    let keyring = Keyring::from_provider(&provider).expect("keyring");
    let second = FieldCodec::new(&keyring, FieldKind::Email).expect("codec");

    assert_eq!(second.decode(sealed.ciphertext()).expect("decode"), "alice@example.com");
    assert_eq!(second.blind_index("alice@example.com").expect("index"), *sealed.blind_index());
}

#[test]
fn test_different_key_dirs_do_not_interoperate() {
    let dir_a = TempDir::new().expect("Failed to create temp dir");
    let dir_b = TempDir::new().expect("Failed to create temp dir");
    let a = FieldCodec::new(&keyring_in(&dir_a), FieldKind::Email).expect("codec");
    let b = FieldCodec::new(&keyring_in(&dir_b), FieldKind::Email).expect("codec");

    let sealed = a.encode("alice@example.com").expect("encode");

    assert!(b.decode(sealed.ciphertext()).is_err());
    assert_ne!(b.blind_index("alice@example.com").expect("index"), *sealed.blind_index());
}

#[test]
fn test_example_scenario() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let codec = FieldCodec::new(&keyring_in(&temp_dir), FieldKind::Email).expect("codec");
    let store = Arc::new(MemoryStore::new());
    let scope = FieldScope::new("users", "email");

    let sealed = codec.encode("user@test.com").expect("encode");
    let again = codec.encode("user@test.com").expect("encode");
    assert_ne!(sealed.ciphertext(), again.ciphertext());

    let id = store.insert(&scope, &sealed).expect("insert");
    let service = LookupService::new(codec, store, scope);

    assert_eq!(service.lookup_by_value("USER@TEST.COM").expect("lookup"), Some(id));
}

#[test]
fn test_legacy_table_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let codec = FieldCodec::new(&keyring_in(&temp_dir), FieldKind::Phone).expect("codec");
    let store = Arc::new(MemoryStore::new());
    let scope = FieldScope::new("applications", "telephone");

    let plain = store.insert_legacy(&scope, "905551234567");
    let sealed_early = codec.encode("905559876543").expect("encode");
    let early = store.insert_legacy(&scope, sealed_early.ciphertext());
    let dup = store.insert_legacy(&scope, " 905551234567 ");

    // Transitional reads find legacy rows before the migration runs
    let service = LookupService::new(codec.clone(), Arc::clone(&store), scope.clone())
        .with_legacy_fallback(100);
    assert_eq!(service.find_with_legacy_fallback("905559876543").expect("lookup"), Some(early));

    let report = Migrator::new(codec.clone(), Arc::clone(&store), scope.clone())
        .run()
        .expect("migration");
    assert_eq!(report.migrated, 1);
    assert_eq!(report.already_conformant, 1);
    assert_eq!(report.duplicate_row_ids(), vec![plain, dup]);

    let plain_row = store.get(&scope, plain).expect("get").expect("row");
    assert!(FieldCodec::is_sealed(&plain_row.value));
    assert_eq!(service.reveal(plain).expect("reveal").plaintext, "905551234567");
    assert_eq!(service.lookup_by_value("905551234567").expect("lookup"), Some(plain));
}
