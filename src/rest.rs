//! REST API over the registry (axum, default port 11111)
//!
//! Every route except `/register`, `/login` and `/health` sits behind a bearer
//! token. The middleware resolves the token to a live [`User`] and hands it to
//! handlers as an extension; all capability checks happen in the registry.
//! sled is synchronous, so registry calls run on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Path, Query as QueryParams, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::auth::{bearer_token, AuthError, TokenKeys};
use crate::error::{Error, ErrorKind};
use crate::integrity::DeletionReport;
use crate::models::{
    Completion, Contract, ContractUpdate, DeletePolicy, Id, MaintenanceRequest, MaintenanceUpdate,
    MarkPaid, NewContract, NewMaintenanceRequest, NewPayment, NewProperty, NewUser, Payment,
    PaymentUpdate, Property, PropertyStatus, PropertyUpdate, PublicUser, Termination, User,
    UserUpdate,
};
use crate::query::Query;
use crate::reconcile::ReconcileReport;
use crate::registry::{Registry, RentSchedule};

/// Shared app state for REST handlers
pub struct AppState {
    registry: Registry,
    tokens: TokenKeys,
}

type SharedState = Arc<AppState>;
type Params = QueryParams<BTreeMap<String, String>>;

/// Failure as seen by HTTP clients
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    Unauthorized(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Hash(e) => ApiError::Internal(e.to_string()),
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    detail: String,
    fields: Vec<String>,
}

fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::InvalidStateTransition => StatusCode::CONFLICT,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation_error",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Conflict => "conflict",
        ErrorKind::InvalidStateTransition => "invalid_state_transition",
        ErrorKind::Forbidden => "forbidden",
        ErrorKind::Internal => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Core(e) => {
                let kind = e.kind();
                if kind == ErrorKind::Internal {
                    tracing::error!(error = %e, "request failed");
                }
                let detail = if kind == ErrorKind::Internal {
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                (
                    status_of(kind),
                    ErrorBody {
                        kind: kind_name(kind),
                        detail,
                        fields: e.fields(),
                    },
                )
            }
            ApiError::Unauthorized(detail) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    kind: "unauthorized",
                    detail,
                    fields: vec![],
                },
            ),
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        kind: "internal",
                        detail: "internal error".to_string(),
                        fields: vec![],
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Run a registry call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

fn malformed_body(rejection: JsonRejection) -> ApiError {
    ApiError::Core(Error::invalid("body", rejection.body_text()))
}

/// JSON request body whose rejections answer with the usual error body
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<axum::body::Body>, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(malformed_body)?;
        Ok(JsonBody(value))
    }
}

/// JSON body that may be left out entirely; an empty body yields `T::default()`
pub struct OptionalJsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for OptionalJsonBody<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<axum::body::Body>, state: &S) -> Result<Self, ApiError> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::Core(Error::invalid("body", e.body_text())))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalJsonBody(T::default()));
        }
        let Json(value) = Json::<T>::from_bytes(&bytes).map_err(malformed_body)?;
        Ok(OptionalJsonBody(value))
    }
}

async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let claims = state.tokens.validate(bearer_token(auth_header)?)?;

    let registry = state.registry.clone();
    let user = blocking(move || registry.storage().get::<User>(claims.sub)).await?;
    let user = user.filter(|u| u.is_active).ok_or(AuthError::UnknownUser)?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Create the router
pub fn create_router(registry: Registry, tokens: TokenKeys) -> Router {
    let state = Arc::new(AppState { registry, tokens });

    let auth_routes = Router::new()
        .route("/me", get(me_handler).put(update_me_handler))
        .route("/users", get(list_users_handler).post(create_user_handler))
        .route(
            "/users/:id",
            get(get_user_handler).put(update_user_handler).delete(delete_user_handler),
        )
        .route("/properties", get(list_properties_handler).post(create_property_handler))
        .route(
            "/properties/:id",
            get(get_property_handler)
                .put(update_property_handler)
                .delete(delete_property_handler),
        )
        .route("/properties/:id/status", put(property_status_handler))
        .route("/contracts", get(list_contracts_handler).post(create_contract_handler))
        .route("/contracts/expiring", get(expiring_contracts_handler))
        .route("/contracts/:id", get(get_contract_handler).put(update_contract_handler))
        .route("/contracts/:id/activate", post(activate_contract_handler))
        .route("/contracts/:id/terminate", post(terminate_contract_handler))
        .route("/contracts/:id/generate-rent", post(generate_rent_handler))
        .route("/payments", get(list_payments_handler).post(create_payment_handler))
        .route("/payments/overdue", get(overdue_payments_handler))
        .route("/payments/upcoming", get(upcoming_payments_handler))
        .route("/payments/:id", get(get_payment_handler).put(update_payment_handler))
        .route("/payments/:id/mark-paid", post(mark_paid_handler))
        .route("/payments/:id/cancel", post(cancel_payment_handler))
        .route("/maintenance", get(list_maintenance_handler).post(create_maintenance_handler))
        .route("/maintenance/high-priority", get(high_priority_handler))
        .route("/maintenance/emergency", get(emergency_handler))
        .route("/maintenance/stale", get(stale_requests_handler))
        .route(
            "/maintenance/:id",
            get(get_maintenance_handler).put(update_maintenance_handler),
        )
        .route("/maintenance/:id/complete", post(complete_maintenance_handler))
        .route("/admin/reconcile", post(reconcile_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/health", get(health_handler))
        .merge(auth_routes)
        .with_state(state)
}

// --- Session ---

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn register_handler(
    State(state): State<SharedState>,
    JsonBody(payload): JsonBody<NewUser>,
) -> Result<(StatusCode, Json<PublicUser>), ApiError> {
    let registry = state.registry.clone();
    let user = blocking(move || registry.register_user(payload)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_handler(
    State(state): State<SharedState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let registry = state.registry.clone();
    let user = blocking(move || registry.authenticate(&payload.email, &payload.password))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid email or password".to_string()))?;
    let access_token = state.tokens.issue(&user)?;
    tracing::info!(user_id = user.id, "login");
    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.ttl_seconds(),
    }))
}

async fn me_handler(Extension(actor): Extension<User>) -> Json<PublicUser> {
    Json(PublicUser::from(actor))
}

async fn update_me_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(patch): JsonBody<UserUpdate>,
) -> Result<Json<PublicUser>, ApiError> {
    let registry = state.registry.clone();
    let user = blocking(move || registry.update_user(&actor, actor.id, patch)).await?;
    Ok(Json(user))
}

// --- Users ---

async fn list_users_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
) -> Result<Json<Vec<PublicUser>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.list_users(&actor)).await?))
}

async fn create_user_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(payload): JsonBody<NewUser>,
) -> Result<(StatusCode, Json<PublicUser>), ApiError> {
    let registry = state.registry.clone();
    let user = blocking(move || registry.create_user(&actor, payload)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<PublicUser>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.get_user(&actor, id)).await?))
}

async fn update_user_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(patch): JsonBody<UserUpdate>,
) -> Result<Json<PublicUser>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.update_user(&actor, id, patch)).await?))
}

async fn delete_user_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<StatusCode, ApiError> {
    let registry = state.registry.clone();
    blocking(move || registry.delete_user(&actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Properties ---

#[derive(Deserialize)]
pub struct StatusChange {
    pub status: PropertyStatus,
}

#[derive(Deserialize, Default)]
pub struct DeleteOptions {
    #[serde(default)]
    pub cascade: bool,
}

async fn list_properties_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(params): Params,
) -> Result<Json<Vec<Property>>, ApiError> {
    let query = Query::parse(&params)?;
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.list_properties(&actor, &query)).await?))
}

async fn create_property_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(payload): JsonBody<NewProperty>,
) -> Result<(StatusCode, Json<Property>), ApiError> {
    let registry = state.registry.clone();
    let property = blocking(move || registry.create_property(&actor, payload)).await?;
    Ok((StatusCode::CREATED, Json(property)))
}

async fn get_property_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<Property>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.get_property(&actor, id)).await?))
}

async fn update_property_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(patch): JsonBody<PropertyUpdate>,
) -> Result<Json<Property>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.update_property(&actor, id, patch)).await?))
}

async fn property_status_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(change): JsonBody<StatusChange>,
) -> Result<Json<Property>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.set_property_status(&actor, id, change.status)).await?,
    ))
}

async fn delete_property_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    QueryParams(options): QueryParams<DeleteOptions>,
) -> Result<Json<DeletionReport>, ApiError> {
    let policy = if options.cascade {
        DeletePolicy::Cascade
    } else {
        DeletePolicy::Restrict
    };
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.delete_property(&actor, id, policy)).await?))
}

// --- Contracts ---

#[derive(Deserialize, Default)]
pub struct Window {
    pub days: Option<i64>,
}

async fn list_contracts_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(params): Params,
) -> Result<Json<Vec<Contract>>, ApiError> {
    let query = Query::parse(&params)?;
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.list_contracts(&actor, &query)).await?))
}

async fn create_contract_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(payload): JsonBody<NewContract>,
) -> Result<(StatusCode, Json<Contract>), ApiError> {
    let registry = state.registry.clone();
    let contract = blocking(move || registry.create_contract(&actor, payload)).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

async fn expiring_contracts_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(window): QueryParams<Window>,
) -> Result<Json<Vec<Contract>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.expiring_contracts(&actor, window.days)).await?,
    ))
}

async fn get_contract_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<Contract>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.get_contract(&actor, id)).await?))
}

async fn update_contract_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(patch): JsonBody<ContractUpdate>,
) -> Result<Json<Contract>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.update_contract(&actor, id, patch)).await?))
}

async fn activate_contract_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<Contract>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.activate_contract(&actor, id)).await?))
}

async fn terminate_contract_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    OptionalJsonBody(input): OptionalJsonBody<Termination>,
) -> Result<Json<Contract>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.terminate_contract(&actor, id, input)).await?,
    ))
}

async fn generate_rent_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<RentSchedule>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.generate_rent_payments(&actor, id)).await?))
}

// --- Payments ---

async fn list_payments_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(params): Params,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let query = Query::parse(&params)?;
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.list_payments(&actor, &query)).await?))
}

async fn create_payment_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(payload): JsonBody<NewPayment>,
) -> Result<(StatusCode, Json<Payment>), ApiError> {
    let registry = state.registry.clone();
    let payment = blocking(move || registry.create_payment(&actor, payload)).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn overdue_payments_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.overdue_payments(&actor)).await?))
}

async fn upcoming_payments_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(window): QueryParams<Window>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.upcoming_payments(&actor, window.days)).await?,
    ))
}

async fn get_payment_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<Payment>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.get_payment(&actor, id)).await?))
}

async fn update_payment_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(patch): JsonBody<PaymentUpdate>,
) -> Result<Json<Payment>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.update_payment(&actor, id, patch)).await?))
}

async fn mark_paid_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    OptionalJsonBody(input): OptionalJsonBody<MarkPaid>,
) -> Result<Json<Payment>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.mark_payment_paid(&actor, id, input)).await?))
}

async fn cancel_payment_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<Payment>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.cancel_payment(&actor, id)).await?))
}

// --- Maintenance ---

async fn list_maintenance_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(params): Params,
) -> Result<Json<Vec<MaintenanceRequest>>, ApiError> {
    let query = Query::parse(&params)?;
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.list_maintenance_requests(&actor, &query)).await?,
    ))
}

async fn create_maintenance_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    JsonBody(payload): JsonBody<NewMaintenanceRequest>,
) -> Result<(StatusCode, Json<MaintenanceRequest>), ApiError> {
    let registry = state.registry.clone();
    let request = blocking(move || registry.create_maintenance_request(&actor, payload)).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn high_priority_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
) -> Result<Json<Vec<MaintenanceRequest>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.high_priority_requests(&actor)).await?))
}

async fn emergency_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
) -> Result<Json<Vec<MaintenanceRequest>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.emergency_requests(&actor)).await?))
}

async fn stale_requests_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    QueryParams(window): QueryParams<Window>,
) -> Result<Json<Vec<MaintenanceRequest>>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.stale_requests(&actor, window.days)).await?))
}

async fn get_maintenance_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
) -> Result<Json<MaintenanceRequest>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.get_maintenance_request(&actor, id)).await?,
    ))
}

async fn update_maintenance_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(patch): JsonBody<MaintenanceUpdate>,
) -> Result<Json<MaintenanceRequest>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.update_maintenance_request(&actor, id, patch)).await?,
    ))
}

async fn complete_maintenance_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
    Path(id): Path<Id>,
    JsonBody(payload): JsonBody<Completion>,
) -> Result<Json<MaintenanceRequest>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(
        blocking(move || registry.complete_maintenance_request(&actor, id, payload)).await?,
    ))
}

// --- Admin ---

async fn reconcile_handler(
    State(state): State<SharedState>,
    Extension(actor): Extension<User>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.reconcile(&actor)).await?))
}
