use crate::api::{ApiClient, ApiError, TokenPair, User};
use crate::storage::{self, Storage, StorageResult, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub fn store_tokens(storage: &dyn Storage, tokens: &TokenPair) -> StorageResult<()> {
    storage.set(ACCESS_TOKEN_KEY, &tokens.access_token)?;
    storage.set(REFRESH_TOKEN_KEY, &tokens.refresh_token)
}

pub fn clear_tokens(storage: &dyn Storage) -> StorageResult<()> {
    storage.remove(ACCESS_TOKEN_KEY)?;
    storage.remove(REFRESH_TOKEN_KEY)
}

fn refresh_token(storage: &dyn Storage) -> Option<String> {
    storage
        .get(REFRESH_TOKEN_KEY)
        .ok()
        .flatten()
        .filter(|t| !t.is_empty())
}

pub async fn login(
    client: &ApiClient,
    storage: &dyn Storage,
    email: &str,
    password: &str,
) -> Result<User, AuthError> {
    let tokens = client.login(email, password).await?;
    store_tokens(storage, &tokens)?;
    let user = client.me(&tokens.access_token).await?;
    info!(email = %user.email, "signed in");
    Ok(user)
}

/// Revoke the refresh token on the server (best effort) and forget both
/// tokens locally.
pub async fn logout(client: &ApiClient, storage: &dyn Storage) -> StorageResult<()> {
    if let Some(refresh) = refresh_token(storage) {
        let access = storage::access_token(storage);
        if let Err(e) = client.logout(access.as_deref(), &refresh).await {
            debug!(error = %e, "logout request failed, ignoring");
        }
    }
    clear_tokens(storage)
}

/// Re-establish the signed-in user from stored tokens: try the access
/// token, then one refresh. When both fail the tokens are dropped, which
/// makes the client anonymous.
pub async fn restore(client: &ApiClient, storage: &dyn Storage) -> StorageResult<Option<User>> {
    let Some(access) = storage::access_token(storage) else {
        return Ok(None);
    };

    match client.me(&access).await {
        Ok(user) => return Ok(Some(user)),
        Err(e) => debug!(error = %e, "access token rejected, trying refresh"),
    }

    if let Some(refresh) = refresh_token(storage) {
        match client.refresh(&refresh).await {
            Ok(tokens) => {
                store_tokens(storage, &tokens)?;
                match client.me(&tokens.access_token).await {
                    Ok(user) => return Ok(Some(user)),
                    Err(e) => warn!(error = %e, "refreshed token rejected"),
                }
            }
            Err(e) => warn!(error = %e, "token refresh failed"),
        }
    }

    clear_tokens(storage)?;
    Ok(None)
}
