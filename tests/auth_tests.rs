mod common;

use common::{mobile_token, sign_token, TEST_SECRET};
use serde_json::json;

use talkback_server::auth::{Role, TokenResolver, UserResolver};
use talkback_server::error::AppError;

#[tokio::test]
async fn verified_token_resolves_identity_and_role() {
    let resolver = TokenResolver::new(true, TEST_SECRET);
    let token = sign_token(
        &json!({ "uid": "TELENET_81*14946*0011", "role": "dashboard" }),
        TEST_SECRET,
    );

    let user = resolver.resolve(&token).await.expect("should resolve");
    assert_eq!(user.user_id, "TELENET_81*14946*0011");
    assert_eq!(user.role, Role::Dashboard);
}

#[tokio::test]
async fn mobile_token_helper_resolves_as_mobile() {
    let resolver = TokenResolver::new(true, TEST_SECRET);
    let user = resolver.resolve(&mobile_token("A")).await.unwrap();
    assert_eq!(user.user_id, "A");
    assert_eq!(user.role, Role::Mobile);
}

#[tokio::test]
async fn tampered_token_is_rejected_when_auth_enabled() {
    let resolver = TokenResolver::new(true, TEST_SECRET);
    let token = sign_token(&json!({ "uid": "A" }), "some-other-secret-key!!!");

    assert!(matches!(
        resolver.resolve(&token).await,
        Err(AppError::Auth(_))
    ));
}

#[tokio::test]
async fn opaque_token_is_rejected_when_auth_enabled() {
    let resolver = TokenResolver::new(true, TEST_SECRET);
    assert!(matches!(
        resolver.resolve("not-a-jwt-at-all").await,
        Err(AppError::Auth(_))
    ));
}

#[tokio::test]
async fn unsigned_mode_decodes_claims_without_verifying() {
    let resolver = TokenResolver::new(false, "");
    // Signed with a secret the resolver has never seen.
    let token = sign_token(&json!({ "sub": "B", "role": "web" }), "whatever-key");

    let user = resolver.resolve(&token).await.unwrap();
    assert_eq!(user.user_id, "B");
    assert_eq!(user.role, Role::Web);
}

#[tokio::test]
async fn unsigned_mode_falls_back_to_raw_token_as_uid() {
    let resolver = TokenResolver::new(false, "");
    let user = resolver.resolve("bare-opaque-token").await.unwrap();
    assert_eq!(user.user_id, "bare-opaque-token");
    assert_eq!(user.role, Role::Mobile);
}

#[tokio::test]
async fn claims_without_any_user_id_fall_back_to_raw_in_unsigned_mode() {
    let resolver = TokenResolver::new(false, "");
    let token = sign_token(&json!({ "foo": "bar" }), "whatever-key");

    let user = resolver.resolve(&token).await.unwrap();
    assert_eq!(user.user_id, token);
}
