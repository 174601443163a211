use rbox_storage::{save_records, ServerRecord, StorageError, Vault};
use remotebox::{App, AppConfig};
use secrecy::{ExposeSecret, SecretString};

fn record_with_password(vault: &Vault) -> ServerRecord {
    let mut record = ServerRecord::local("lab");
    record.host = "vbox.example.net".into();
    record.port = 2222;
    record.user = "ops".into();
    record.pass = Some(vault.encrypt("hunter2").unwrap());
    record
}

#[tokio::test]
async fn stored_password_is_decrypted_into_server_params() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        servers_file: dir.path().join("servers.json"),
        ..AppConfig::default()
    };
    let vault = Vault::new(SecretString::new("open sesame".into()));
    save_records(&config.servers_file, &[record_with_password(&vault)]).unwrap();

    let app = App::build(config, Some(&vault)).await.unwrap();
    let server = app.service.server("lab").await.unwrap();
    let ssh = server.params().remote.as_ref().unwrap();
    assert_eq!(ssh.display_target(), "ops@vbox.example.net:2222");
    assert_eq!(ssh.secret.as_ref().unwrap().expose_secret(), "hunter2");
    assert!(!server.is_connected().await);
}

#[tokio::test]
async fn stored_password_without_passphrase_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        servers_file: dir.path().join("servers.json"),
        ..AppConfig::default()
    };
    let vault = Vault::new(SecretString::new("open sesame".into()));
    save_records(&config.servers_file, &[record_with_password(&vault)]).unwrap();

    let err = App::build(config, None).await.err().unwrap();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::VaultLocked(_))
    ));
}
