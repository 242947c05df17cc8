//! Tests for the authentication flows and login session reuse.

mod common;

use chrono::{Duration, Utc};
use mockito::{Matcher, Server};
use serde_json::json;

use common::{jwt, settings, write_file, ScriptedProvider, PROJECT};
use secure_transfer::{
    Authenticator, Environment, FileApiClient, Operation, Registry, SessionStore, Token, TokenKind,
    TransferError, TransferPolicy,
};

/// Register a valid API key for PROJECT in the test environment.
fn register(settings: &secure_transfer::Settings, api_key: &str) {
    let mut registry = Registry::default();
    registry.insert(Environment::Test, PROJECT, api_key);
    registry.save(&settings.registry_path()).unwrap();
}

fn cached_token(kind: TokenKind, issued_offset: i64, expires_offset: i64) -> Token {
    let now = Utc::now();
    Token::new(
        Environment::Test,
        PROJECT,
        kind,
        format!("cached-{}", kind),
        now + Duration::seconds(issued_offset),
        now + Duration::seconds(expires_offset),
    )
    .unwrap()
}

mod credential_flow {
    use super::*;

    #[tokio::test]
    async fn reuses_valid_session_without_login() {
        let mut server = Server::new_async().await;
        let login = server.mock("POST", "/p11/auth").expect(0).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));
        let cached = cached_token(TokenKind::Import, -60, 3600);
        SessionStore::new(settings.session_path()).put(&cached).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Upload, false).await.unwrap();

        assert_eq!(token, cached);
        assert_eq!(provider.credential_prompts.get(), 0);
        assert_eq!(provider.confirm_prompts.get(), 0);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn expired_session_forces_login() {
        let mut server = Server::new_async().await;
        let api_key = jwt(86400);
        let issued = jwt(3600);

        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::UrlEncoded("type".into(), "import".into()))
            .match_header("authorization", format!("Bearer {}", api_key).as_str())
            .match_body(Matcher::Json(json!({
                "user_name": "p11-alice",
                "password": "correct horse",
                "otp": "123456"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "token": issued }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &api_key);
        let store = SessionStore::new(settings.session_path());
        store.put(&cached_token(TokenKind::Import, -7200, -3600)).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Upload, false).await.unwrap();

        assert_eq!(token.value, issued);
        assert_eq!(token.kind, TokenKind::Import);
        assert_eq!(provider.credential_prompts.get(), 1);
        assert_eq!(store.get(Environment::Test, PROJECT, TokenKind::Import), Some(token));
        login.assert_async().await;
    }

    #[tokio::test]
    async fn missing_session_forces_login_for_export() {
        let mut server = Server::new_async().await;
        let issued = jwt(3600);

        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::UrlEncoded("type".into(), "export".into()))
            .with_status(200)
            .with_body(json!({ "token": issued }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Download, false).await.unwrap();

        assert_eq!(token.kind, TokenKind::Export);
        assert!(auth
            .store()
            .get(Environment::Test, PROJECT, TokenKind::Import)
            .is_none());
        login.assert_async().await;
    }

    #[tokio::test]
    async fn expiring_session_refreshed_when_confirmed() {
        let mut server = Server::new_async().await;
        let issued = jwt(3600);
        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({ "token": issued }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));
        SessionStore::new(settings.session_path())
            .put(&cached_token(TokenKind::Import, -3000, 60))
            .unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Upload, false).await.unwrap();

        assert_eq!(token.value, issued);
        assert_eq!(provider.confirm_prompts.get(), 1);
        assert_eq!(provider.credential_prompts.get(), 1);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn expiring_session_kept_when_declined() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));
        let cached = cached_token(TokenKind::Import, -3000, 60);
        SessionStore::new(settings.session_path()).put(&cached).unwrap();

        let provider = ScriptedProvider::new(false);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::ResumeList, false).await.unwrap();

        assert_eq!(token, cached);
        assert_eq!(provider.confirm_prompts.get(), 1);
        assert_eq!(provider.credential_prompts.get(), 0);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_credentials_fail_without_retry() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"message": "invalid one time code"}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let result = auth.authorize(PROJECT, Operation::Upload, false).await;

        assert!(matches!(result, Err(TransferError::Auth(_))));
        assert_eq!(provider.credential_prompts.get(), 1);
        assert!(!settings.session_path().exists());
        login.assert_async().await;
    }
}

mod registration {
    use super::*;

    #[tokio::test]
    async fn unregistered_project_is_config_error() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let result = auth.authorize(PROJECT, Operation::Upload, false).await;

        assert!(matches!(result, Err(TransferError::Config(_))));
        assert_eq!(provider.credential_prompts.get(), 0);
    }

    #[tokio::test]
    async fn expired_api_key_is_config_error() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(-60));

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let result = auth.authorize(PROJECT, Operation::Upload, true).await;

        assert!(matches!(result, Err(TransferError::Config(msg)) if msg.contains("register")));
    }

    #[tokio::test]
    async fn unreadable_api_key_counts_as_expired() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, "not-a-jwt");

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let result = auth.authorize(PROJECT, Operation::Upload, false).await;

        assert!(matches!(result, Err(TransferError::Config(_))));
    }
}

mod key_flow {
    use super::*;

    #[tokio::test]
    async fn issues_uncached_import_token() {
        let mut server = Server::new_async().await;
        let api_key = jwt(86400);
        let issued = jwt(3600);

        let basic = server
            .mock("POST", "/p11/auth/basic")
            .match_query(Matcher::UrlEncoded("type".into(), "import".into()))
            .match_header("authorization", format!("Bearer {}", api_key).as_str())
            .with_status(200)
            .with_body(json!({ "token": issued }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &api_key);

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Upload, true).await.unwrap();

        assert_eq!(token.value, issued);
        assert_eq!(token.kind, TokenKind::Import);
        assert_eq!(provider.credential_prompts.get(), 0);
        assert!(auth
            .store()
            .get(Environment::Test, PROJECT, TokenKind::Import)
            .is_none());
        basic.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_for_export_operations() {
        let mut server = Server::new_async().await;
        let basic = server
            .mock("POST", "/p11/auth/basic")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();

        for operation in [Operation::Download, Operation::DownloadList] {
            let result = auth.authorize(PROJECT, operation, true).await;
            assert!(matches!(result, Err(TransferError::Auth(_))));
        }
        basic.assert_async().await;
    }
}

mod rejected_session {
    use super::*;

    #[tokio::test]
    async fn server_rejection_forces_login_on_next_run() {
        let mut server = Server::new_async().await;
        let upload = server
            .mock("PUT", "/p11/files/stream")
            .match_header("authorization", "Bearer revoked")
            .with_status(401)
            .with_body(r#"{"message": "token revoked"}"#)
            .expect(1)
            .create_async()
            .await;
        let issued = jwt(3600);
        let login = server
            .mock("POST", "/p11/auth")
            .match_query(Matcher::UrlEncoded("type".into(), "import".into()))
            .with_status(200)
            .with_body(json!({ "token": issued }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        register(&settings, &jwt(86400));
        let now = Utc::now();
        let revoked = Token::new(
            Environment::Test,
            PROJECT,
            TokenKind::Import,
            "revoked".to_string(),
            now - Duration::minutes(5),
            now + Duration::hours(1),
        )
        .unwrap();
        SessionStore::new(settings.session_path()).put(&revoked).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let token = auth.authorize(PROJECT, Operation::Upload, false).await.unwrap();
        assert_eq!(token, revoked);

        let client = FileApiClient::new(&server.url(), token);
        let path = write_file(dir.path(), "data.txt", b"hello");
        let err = client
            .upload_file(&path, None, None, &TransferPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SessionExpired(_)));
        assert!(auth.forget_if_rejected(client.token(), &err).unwrap());

        let token = auth.authorize(PROJECT, Operation::Upload, false).await.unwrap();
        assert_eq!(token.value, issued);
        assert_eq!(provider.credential_prompts.get(), 1);
        upload.assert_async().await;
        login.assert_async().await;
    }

    #[tokio::test]
    async fn other_failures_keep_the_session() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let cached = cached_token(TokenKind::Import, -60, 3600);
        SessionStore::new(settings.session_path()).put(&cached).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let err = TransferError::Network("connection reset".into());

        assert!(!auth.forget_if_rejected(&cached, &err).unwrap());
        assert_eq!(
            auth.store().get(Environment::Test, PROJECT, TokenKind::Import),
            Some(cached)
        );
    }

    #[tokio::test]
    async fn newer_session_is_not_removed() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let newer = cached_token(TokenKind::Import, -60, 3600);
        SessionStore::new(settings.session_path()).put(&newer).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let mut stale = newer.clone();
        stale.value = "stale".to_string();

        assert!(!auth.invalidate(&stale).unwrap());
        assert_eq!(
            auth.store().get(Environment::Test, PROJECT, TokenKind::Import),
            Some(newer)
        );
    }
}

mod client_registration {
    use super::*;

    #[tokio::test]
    async fn credentials_exchanged_for_api_key() {
        let mut server = Server::new_async().await;
        let api_key = jwt(86400);
        let exchange = server
            .mock("POST", "/p11/apikey")
            .match_body(Matcher::Json(json!({
                "user_name": "p11-alice",
                "password": "correct horse",
                "otp": "123456"
            })))
            .with_status(200)
            .with_body(json!({ "api_key": api_key }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();

        let (project, key) = auth.fetch_api_key().await.unwrap();
        assert_eq!(project, PROJECT);
        assert_eq!(key, api_key);
        assert_eq!(provider.credential_prompts.get(), 1);

        auth.save_api_key(&project, &key).unwrap();
        let registry = Registry::load(&settings.registry_path()).unwrap();
        assert_eq!(registry.api_key(Environment::Test, PROJECT), Some(api_key.as_str()));
        exchange.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_credentials_register_nothing() {
        let mut server = Server::new_async().await;
        let _exchange = server
            .mock("POST", "/p11/apikey")
            .with_status(401)
            .with_body(r#"{"message": "invalid one time code"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();

        assert!(matches!(auth.fetch_api_key().await, Err(TransferError::Auth(_))));
        assert!(!settings.registry_path().exists());
    }

    #[tokio::test]
    async fn expired_key_is_not_saved() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();

        let result = auth.save_api_key(PROJECT, &jwt(-60));
        assert!(matches!(result, Err(TransferError::Config(_))));
        assert!(!settings.registry_path().exists());
    }

    #[tokio::test]
    async fn saving_keeps_other_registrations() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &server.url());
        let mut registry = Registry::default();
        registry.insert(Environment::Prod, "p22", "prod-key");
        registry.save(&settings.registry_path()).unwrap();

        let provider = ScriptedProvider::new(true);
        let auth = Authenticator::new(&settings, &provider).unwrap();
        let key = jwt(86400);
        auth.save_api_key(PROJECT, &key).unwrap();

        let registry = Registry::load(&settings.registry_path()).unwrap();
        assert_eq!(registry.api_key(Environment::Prod, "p22"), Some("prod-key"));
        assert_eq!(registry.api_key(Environment::Test, PROJECT), Some(key.as_str()));
    }
}
