use std::fs;
use std::sync::Arc;
use std::time::Duration;

use lockbox::keys::WrappingKey;
use lockbox::{
    EngineState, ErrorKind, FixedClock, Recovery, ServiceNamespace, TokenIssuer, Uid, cipher,
};

use crate::helpers::*;

const EMAIL: &str = "Ada@Example.com";
const SECRET: &str = "correct horse battery staple";

#[tokio::test]
async fn fresh_user_gets_sealed_settings_database() {
    let t = setup_accounts(GRACE);
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();
    let uid = Uid::from_email(EMAIL);
    let user_dir = t.root().join(uid.as_str());
    assert!(user_dir.join("keyring.enc").is_file());
    assert!(user_dir.join("keyring_key.enc").is_file());

    let keyring = t.accounts.authenticate(&issued.token).await.unwrap();
    assert_eq!(keyring.uid(), &uid);

    let mut session = t
        .accounts
        .open_session(&keyring, ServiceNamespace::Settings, "settings.db", &settings_schema())
        .await
        .unwrap();
    sqlx::query("INSERT INTO settings (key, value) VALUES ('theme', 'dark')")
        .execute(&mut *session)
        .await
        .unwrap();
    session.commit().await.unwrap();

    let db = user_dir.join("settings").join("settings.db");
    assert!(wait_until(SETTLE, || on_disk(&db) == IDLE).await);
    assert!(db.with_file_name("settings.db_dek.enc").is_file());
    assert_eq!(t.accounts.cache().state(&db), EngineState::Absent);

    // The sealed database opens again with the same stored DEK.
    let mut session = t
        .accounts
        .open_session(&keyring, ServiceNamespace::Settings, "settings.db", &settings_schema())
        .await
        .unwrap();
    let (value,): (String,) = sqlx::query_as("SELECT value FROM settings WHERE key = 'theme'")
        .fetch_one(&mut *session)
        .await
        .unwrap();
    assert_eq!(value, "dark");
}

#[tokio::test]
async fn each_login_retires_the_previous_token() {
    let t = setup_accounts(GRACE);
    let mut tokens = vec![t.accounts.register(EMAIL, SECRET).await.unwrap()];
    for _ in 0..3 {
        tokens.push(t.accounts.login("ada@example.com", SECRET).await.unwrap());
    }

    let (latest, earlier) = tokens.split_last().unwrap();
    t.accounts.authenticate(&latest.token).await.unwrap();
    for stale in earlier {
        let err = t.accounts.authenticate(&stale.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
    }

    let secrets: Vec<_> = tokens.iter().map(|issued| issued.access_secret).collect();
    for (i, secret) in secrets.iter().enumerate() {
        assert!(!secrets[i + 1..].contains(secret));
    }
}

#[tokio::test]
async fn credentials_are_checked() {
    let t = setup_accounts(GRACE);
    t.accounts.register(EMAIL, SECRET).await.unwrap();

    let err = t.accounts.register("ADA@example.com", "other").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = t.accounts.login(EMAIL, "wrong secret").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);

    let err = t.accounts.login("nobody@example.com", SECRET).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn tokens_expire_and_must_be_signed_by_us() {
    let t = setup_accounts(GRACE);
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();

    let foreign = TokenIssuer::new(
        b"some-other-secret",
        Duration::from_secs(3600),
        Arc::new(FixedClock::default()),
    )
    .issue(&Uid::from_email(EMAIL), &WrappingKey::generate())
    .unwrap();
    let err = t.accounts.authenticate(&foreign.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = t.accounts.authenticate("not-a-token").await.unwrap_err();
    assert!(err.is_authentication_error());

    t.clock.advance(3599);
    t.accounts.authenticate(&issued.token).await.unwrap();
    t.clock.advance(1);
    let err = t.accounts.authenticate(&issued.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn database_names_stay_inside_the_service_directory() {
    let t = setup_accounts(GRACE);
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();
    let keyring = t.accounts.authenticate(&issued.token).await.unwrap();

    for name in ["../escape.db", "/abs.db", "", "x.db.enc", "x_dek"] {
        let err = t
            .accounts
            .database_key(&keyring, ServiceNamespace::Datasources, name)
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name:?} was accepted");
    }

    let nested = t
        .accounts
        .open_session(
            &keyring,
            ServiceNamespace::Datasources,
            "drive/files.db",
            &notes_schema(),
        )
        .await
        .unwrap();
    drop(nested);

    let dbs = t.accounts.databases(keyring.uid()).await.unwrap();
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0].service, ServiceNamespace::Datasources);
    assert_eq!(dbs[0].name, "drive/files.db");
}

#[tokio::test]
async fn recover_user_repairs_each_database() {
    let t = setup_accounts(Duration::from_secs(600));
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();
    let keyring = t.accounts.authenticate(&issued.token).await.unwrap();
    let schema = notes_schema();

    for (service, name) in [
        (ServiceNamespace::Settings, "settings.db"),
        (ServiceNamespace::Processing, "jobs.db"),
    ] {
        drop(
            t.accounts
                .open_session(&keyring, service, name, &schema)
                .await
                .unwrap(),
        );
    }
    assert_eq!(t.accounts.shutdown().await.unwrap(), 2);

    // Crash the processing database between decrypt and first write.
    let jobs = t
        .accounts
        .root()
        .database(keyring.uid(), ServiceNamespace::Processing, "jobs.db")
        .unwrap();
    let key = t
        .accounts
        .database_key(&keyring, ServiceNamespace::Processing, "jobs.db")
        .await
        .unwrap();
    cipher::decrypt_file(enc(&jobs), &jobs, &key).unwrap();
    fs::rename(enc(&jobs), old(&jobs)).unwrap();

    let report = t.accounts.recover_user(&keyring).await.unwrap();
    let outcomes: Vec<_> = report
        .iter()
        .map(|(db, recovery)| (db.name.as_str(), *recovery))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("jobs.db", Recovery::RestoredRollback),
            ("settings.db", Recovery::Clean),
        ]
    );
    assert_eq!(on_disk(&jobs), IDLE);
}

#[tokio::test]
async fn delete_user_discards_engines_and_files() {
    let t = setup_accounts(Duration::from_secs(600));
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();
    let keyring = t.accounts.authenticate(&issued.token).await.unwrap();
    drop(
        t.accounts
            .open_session(&keyring, ServiceNamespace::Settings, "settings.db", &settings_schema())
            .await
            .unwrap(),
    );
    assert_eq!(t.accounts.cache().live_paths().len(), 1);

    let uid = Uid::from_email(EMAIL);
    t.accounts.delete_user(&uid).await.unwrap();
    assert!(!t.root().join(uid.as_str()).exists());
    assert!(t.accounts.cache().live_paths().is_empty());

    let err = t.accounts.login(EMAIL, SECRET).await.unwrap_err();
    assert!(err.is_not_found());
    let err = t.accounts.authenticate(&issued.token).await.unwrap_err();
    assert!(err.is_not_found());

    // The address can be registered again from scratch.
    t.accounts.register(EMAIL, SECRET).await.unwrap();
}

#[tokio::test]
async fn sweep_removes_interrupted_deletions() {
    let t = setup_accounts(GRACE);
    t.accounts.register(EMAIL, SECRET).await.unwrap();
    let uid = Uid::from_email(EMAIL);

    fs::create_dir_all(t.root().join(".deleting-1").join("leftover")).unwrap();
    fs::create_dir(t.root().join(uid.as_str()).join(".deleting-2")).unwrap();

    assert_eq!(t.accounts.sweep_tombstones().await.unwrap(), 2);
    assert_eq!(t.accounts.sweep_tombstones().await.unwrap(), 0);
    assert!(t.root().join(uid.as_str()).join("keyring.enc").exists());
}

#[tokio::test]
async fn hosted_deployment_needs_mounted_directory() {
    let t = setup_hosted_accounts(GRACE);
    let uid = Uid::from_email(EMAIL);

    let err = t.accounts.register(EMAIL, SECRET).await.unwrap_err();
    assert!(err.is_transient());
    assert!(!t.root().join(uid.as_str()).exists());

    let mount = t.root().join(uid.as_str());
    fs::create_dir(&mount).unwrap();
    let issued = t.accounts.register(EMAIL, SECRET).await.unwrap();
    let keyring = t.accounts.authenticate(&issued.token).await.unwrap();
    drop(
        t.accounts
            .open_session(&keyring, ServiceNamespace::Settings, "settings.db", &settings_schema())
            .await
            .unwrap(),
    );

    // Deleting empties the mount but leaves the mount point.
    t.accounts.delete_user(&uid).await.unwrap();
    assert!(mount.is_dir());
    assert_eq!(fs::read_dir(&mount).unwrap().count(), 0);

    // An unmounted directory is a storage problem, not a missing user.
    fs::remove_dir(&mount).unwrap();
    let err = t.accounts.login(EMAIL, SECRET).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}
