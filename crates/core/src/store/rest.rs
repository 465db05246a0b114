//! PostgREST-backed stores plus the hosted auth endpoints.

use std::sync::{PoisonError, RwLock};

use reqwest::{header::HeaderValue, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use trotro_transit::{
    CreatedRoute, IdentityProvider, NewAccount, RouteIdentifier, RouteInfo, RouteRow, RouteStore,
    SearchHistoryEntry, Session, Stop, StopDirectory, StoreError, StoreFuture, UserIdentifier,
    UserProfile, UserStore,
};

use unicode_segmentation::UnicodeSegmentation;

use crate::config::StoreConfig;
use crate::suggest::MIN_QUERY_LEN;

const ROUTE_SELECT: &str =
    "*,route_stops(stop_order,fare_to_next,distance_to_next,stops(id,name,latitude,longitude))";

pub struct RestStore {
    client: Client,
    base: Url,
    anon_key: String,
    retries: u32,
    reset_redirect: Option<String>,
    access_token: RwLock<Option<String>>,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Self::with_client(config, client)
    }

    /// Use a preconfigured client. `config.request_timeout` is not applied.
    pub fn with_client(config: &StoreConfig, client: Client) -> Result<Self, StoreError> {
        let mut base = Url::parse(&config.url)
            .map_err(|e| StoreError::Transport(format!("invalid store url {:?}: {e}", config.url)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client,
            base,
            anon_key: config.anon_key.clone(),
            retries: config.retries,
            reset_redirect: config.reset_redirect.clone(),
            access_token: RwLock::new(None),
        })
    }

    /// Act as a signed-in user. Row-level security on the store keys off this.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    pub(crate) fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, StoreError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| StoreError::Transport(format!("invalid endpoint {path:?}: {e}")))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, bearer: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    /// Auth endpoints that act before there is a user token.
    fn auth_post(&self, url: Url) -> RequestBuilder {
        self.client.post(url).header("apikey", &self.anon_key)
    }

    /// Send, retrying transient failures up to the configured count.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, StoreError> {
        let mut attempt = 0;
        loop {
            let result = match build().send().await {
                Ok(response) => check_status(response).await,
                Err(e) => Err(transport_error(e)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "store request failed, retrying");
                }
                other => return other,
            }
        }
    }

    async fn get_rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, StoreError> {
        debug!(%url, "store query");
        let bearer = self.bearer();
        let response = self
            .send(|| self.request(Method::GET, url.clone(), &bearer))
            .await?;
        decode(response).await
    }

    async fn get_first<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, StoreError> {
        Ok(self.get_rows(url).await?.into_iter().next())
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(StoreError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

/// PostgREST filter value for a case-insensitive substring match, or `None`
/// when too little of the query survives cleaning to be worth sending.
///
/// Characters that are reserved in filter syntax are dropped rather than
/// quoted; stop names never contain them. `_` matches any single character
/// in `LIKE`, so it is escaped.
pub(crate) fn ilike_pattern(query: &str) -> Option<String> {
    let cleaned: String = query
        .chars()
        .filter(|c| !matches!(c, '*' | '%' | ',' | '(' | ')' | '"' | '\\'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.graphemes(true).count() < MIN_QUERY_LEN {
        return None;
    }
    Some(format!("ilike.*{}*", cleaned.replace('_', "\\_")))
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

// ============================================================================
// Store traits
// ============================================================================

impl RouteStore for RestStore {
    fn fetch_routes(&self) -> StoreFuture<'_, Vec<RouteRow>> {
        Box::pin(async move {
            let url = self.endpoint(
                "rest/v1/routes",
                &[("select", ROUTE_SELECT), ("order", "total_fare.asc")],
            )?;
            self.get_rows(url).await
        })
    }

    fn fetch_route_info<'a>(
        &'a self,
        route_id: &'a RouteIdentifier,
    ) -> StoreFuture<'a, Option<RouteInfo>> {
        Box::pin(async move {
            let filter = eq(route_id.as_str());
            let url = self.endpoint(
                "rest/v1/route_info",
                &[("select", "*"), ("route_id", &filter), ("limit", "1")],
            )?;
            self.get_first(url).await
        })
    }
}

impl StopDirectory for RestStore {
    fn search_stops<'a>(&'a self, query: &'a str, limit: usize) -> StoreFuture<'a, Vec<Stop>> {
        Box::pin(async move {
            let Some(pattern) = ilike_pattern(query) else {
                debug!(query, "nothing searchable in stop query");
                return Ok(Vec::new());
            };
            let limit = limit.to_string();
            let url = self.endpoint(
                "rest/v1/stops",
                &[("select", "*"), ("name", &pattern), ("limit", &limit)],
            )?;
            self.get_rows(url).await
        })
    }
}

impl UserStore for RestStore {
    fn fetch_profile<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Option<UserProfile>> {
        Box::pin(async move {
            let filter = eq(user_id.as_str());
            let url = self.endpoint("rest/v1/users", &[("select", "*"), ("id", &filter)])?;
            self.get_first(url).await
        })
    }

    fn fetch_search_history<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<SearchHistoryEntry>> {
        Box::pin(async move {
            let filter = eq(user_id.as_str());
            let url = self.endpoint(
                "rest/v1/search_history",
                &[
                    ("select", "*"),
                    ("user_id", &filter),
                    ("order", "searched_at.desc"),
                ],
            )?;
            self.get_rows(url).await
        })
    }

    fn fetch_created_routes<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<CreatedRoute>> {
        Box::pin(async move {
            let filter = eq(user_id.as_str());
            let url = self.endpoint(
                "rest/v1/user_created_routes",
                &[
                    ("select", "*"),
                    ("user_id", &filter),
                    ("order", "created_at.desc"),
                ],
            )?;
            self.get_rows(url).await
        })
    }

    fn record_search<'a>(&'a self, entry: &'a SearchHistoryEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint("rest/v1/search_history", &[])?;
            let bearer = self.bearer();
            self.send(|| {
                self.request(Method::POST, url.clone(), &bearer)
                    .header("Prefer", HeaderValue::from_static("return=minimal"))
                    .json(entry)
            })
            .await?;
            Ok(())
        })
    }
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

#[derive(Deserialize)]
struct AuthUser {
    id: UserIdentifier,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: AccountMetadata<'a>,
}

#[derive(Serialize)]
struct AccountMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<&'a str>,
}

/// With email confirmation on, sign-up answers with the bare user.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    Pending(AuthUser),
}

#[derive(Serialize)]
struct RecoverRequest<'a> {
    email: &'a str,
}

impl IdentityProvider for RestStore {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            let url = self.endpoint("auth/v1/token", &[("grant_type", "password")])?;
            let grant = PasswordGrant { email, password };

            let response = self
                .send(|| self.auth_post(url.clone()).json(&grant))
                .await
                .map_err(|e| match e {
                    // Bad credentials come back as 400.
                    StoreError::Status { status: 400, .. } => StoreError::Unauthorized,
                    other => other,
                })?;

            let token: TokenResponse = decode(response).await?;
            self.set_access_token(Some(token.access_token.clone()));

            Ok(Session {
                user_id: token.user.id,
                access_token: token.access_token,
                email: token.user.email,
            })
        })
    }

    fn session_for_token<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            let url = self.endpoint("auth/v1/user", &[])?;
            let response = self
                .send(|| self.request(Method::GET, url.clone(), access_token))
                .await?;

            let user: AuthUser = decode(response).await?;
            self.set_access_token(Some(access_token.to_owned()));

            Ok(Session {
                user_id: user.id,
                access_token: access_token.to_owned(),
                email: user.email,
            })
        })
    }

    fn sign_up<'a>(&'a self, account: &'a NewAccount) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let url = self.endpoint("auth/v1/signup", &[])?;
            let request = SignUpRequest {
                email: &account.email,
                password: &account.password,
                data: AccountMetadata {
                    first_name: account.first_name.as_deref(),
                    last_name: account.last_name.as_deref(),
                },
            };

            let response = self
                .send(|| self.auth_post(url.clone()).json(&request))
                .await?;

            let reply: SignUpResponse = decode(response).await?;
            match reply {
                SignUpResponse::Session(token) => {
                    self.set_access_token(Some(token.access_token.clone()));
                    Ok(Some(Session {
                        user_id: token.user.id,
                        access_token: token.access_token,
                        email: token.user.email,
                    }))
                }
                SignUpResponse::Pending(user) => {
                    debug!(user = %user.id, "account awaiting email confirmation");
                    Ok(None)
                }
            }
        })
    }

    fn sign_out<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.set_access_token(None);

            let url = self.endpoint("auth/v1/logout", &[])?;
            match self
                .send(|| self.request(Method::POST, url.clone(), access_token))
                .await
            {
                // Already expired or revoked.
                Ok(_) | Err(StoreError::Unauthorized) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn send_password_reset<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let params: Vec<(&str, &str)> = self
                .reset_redirect
                .as_deref()
                .map(|redirect| ("redirect_to", redirect))
                .into_iter()
                .collect();
            let url = self.endpoint("auth/v1/recover", &params)?;

            self.send(|| self.auth_post(url.clone()).json(&RecoverRequest { email }))
                .await?;
            Ok(())
        })
    }
}
