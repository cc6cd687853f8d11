use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::models::*;
use shared::schema::*;
use std::fmt::Display;
use tracing::{error, info};

type DbPool = Pool<AsyncPgConnection>;
type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    pub customer_id: Option<i64>,
    pub product_id: Option<i64>,
    pub store_id: Option<i64>,
    pub transaction_type: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    pub unit_price: Option<BigDecimal>,
    pub total_amount: Option<BigDecimal>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub original_transaction_id: Option<i64>,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionResponse {
    pub message: String,
    pub transaction_id: i64,
    pub transaction_type: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/categories", get(list_categories))
        .route("/api/categories/:category_id/subcategories", get(list_subcategories))
        .route("/api/customers", get(list_customers))
        .route("/api/stores", get(list_stores))
        .route("/api/products", get(list_products))
        .route("/api/transactions", get(list_transactions).post(create_transaction))
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn failure<E: Display>(message: &'static str) -> impl FnOnce(E) -> ApiError {
    move |e| {
        error!("{}: {}", message, e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: message.to_string(),
            }),
        )
    }
}

fn rejection(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

pub async fn list_categories(State(state): State<AppState>) -> ApiResult<Vec<Category>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch categories"))?;
    let rows = categories::table
        .order(categories::name.asc())
        .select(Category::as_select())
        .load(&mut conn)
        .await
        .map_err(failure("Failed to fetch categories"))?;
    Ok(Json(rows))
}

pub async fn list_subcategories(
    State(state): State<AppState>,
    Path(category_id): Path<i64>,
) -> ApiResult<Vec<Subcategory>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch subcategories"))?;
    let rows = subcategories::table
        .filter(subcategories::category_id.eq(category_id))
        .order(subcategories::name.asc())
        .select(Subcategory::as_select())
        .load(&mut conn)
        .await
        .map_err(failure("Failed to fetch subcategories"))?;
    Ok(Json(rows))
}

pub async fn list_customers(State(state): State<AppState>) -> ApiResult<Vec<Customer>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch customers"))?;
    let rows = customers::table
        .order(customers::name.asc())
        .select(Customer::as_select())
        .load(&mut conn)
        .await
        .map_err(failure("Failed to fetch customers"))?;
    Ok(Json(rows))
}

pub async fn list_stores(State(state): State<AppState>) -> ApiResult<Vec<Store>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch stores"))?;
    let rows = stores::table
        .order(stores::name.asc())
        .select(Store::as_select())
        .load(&mut conn)
        .await
        .map_err(failure("Failed to fetch stores"))?;
    Ok(Json(rows))
}

pub async fn list_products(State(state): State<AppState>) -> ApiResult<Vec<ProductListing>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch products"))?;
    let rows = diesel::sql_query(PRODUCT_LISTING_SQL)
        .load::<ProductListing>(&mut conn)
        .await
        .map_err(failure("Failed to fetch products"))?;
    Ok(Json(rows))
}

pub async fn list_transactions(State(state): State<AppState>) -> ApiResult<Vec<EnrichedRecord>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch transactions"))?;
    let rows = diesel::sql_query(enriched_transaction_query("ORDER BY t.transaction_date DESC"))
        .load::<EnrichedRecord>(&mut conn)
        .await
        .map_err(failure("Failed to fetch transactions"))?;
    Ok(Json(rows))
}

/// Sales only.
pub async fn list_orders(State(state): State<AppState>) -> ApiResult<Vec<EnrichedRecord>> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to fetch orders"))?;
    let rows = diesel::sql_query(enriched_transaction_query(
        "WHERE t.transaction_type = 'sale' ORDER BY t.transaction_date DESC",
    ))
    .load::<EnrichedRecord>(&mut conn)
    .await
    .map_err(failure("Failed to fetch orders"))?;
    Ok(Json(rows))
}

pub async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<CreateTransactionRequest>,
) -> ApiResult<CreateTransactionResponse> {
    let Some(transaction_type) = request.transaction_type.clone() else {
        return Err(rejection(StatusCode::BAD_REQUEST, "transaction_type is required"));
    };
    insert_transaction(&state, request, transaction_type).await
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateTransactionRequest>,
) -> ApiResult<CreateTransactionResponse> {
    insert_transaction(&state, request, "sale".to_string()).await
}

async fn insert_transaction(
    state: &AppState,
    request: CreateTransactionRequest,
    transaction_type: String,
) -> ApiResult<CreateTransactionResponse> {
    let mut conn = state.pool.get().await.map_err(failure("Failed to create transaction"))?;

    let catalog_price = match request.product_id {
        Some(product_id) if uses_catalog_price(&transaction_type, &request) => {
            let price = products::table
                .find(product_id)
                .select(products::price)
                .first::<BigDecimal>(&mut conn)
                .await
                .optional()
                .map_err(failure("Failed to fetch product"))?;
            match price {
                Some(price) => Some(price),
                None => return Err(rejection(StatusCode::NOT_FOUND, "Product not found")),
            }
        }
        _ => None,
    };

    let (unit_price, total_amount) = resolve_amounts(&request, catalog_price);
    let new_transaction = NewTransaction {
        customer_id: request.customer_id,
        product_id: request.product_id,
        store_id: request.store_id,
        transaction_type: transaction_type.clone(),
        quantity: request.quantity,
        unit_price,
        total_amount,
        status: request.status.unwrap_or_else(|| "completed".to_string()),
        notes: request.notes,
        original_transaction_id: request.original_transaction_id,
    };

    let transaction_id = diesel::insert_into(transactions::table)
        .values(&new_transaction)
        .returning(transactions::id)
        .get_result::<i64>(&mut conn)
        .await
        .map_err(failure("Failed to create transaction"))?;

    info!(transaction_id, transaction_type = %transaction_type, "Created transaction");

    Ok(Json(CreateTransactionResponse {
        message: "Transaction created successfully".to_string(),
        transaction_id,
        transaction_type,
    }))
}

/// Priced sales, services and trade-ins without an explicit price take the catalog price.
fn uses_catalog_price(transaction_type: &str, request: &CreateTransactionRequest) -> bool {
    matches!(transaction_type, "sale" | "service" | "trade_in")
        && request.product_id.is_some()
        && request.unit_price.is_none()
}

fn resolve_amounts(
    request: &CreateTransactionRequest,
    catalog_price: Option<BigDecimal>,
) -> (Option<BigDecimal>, BigDecimal) {
    let quantity = BigDecimal::from(request.quantity);
    match catalog_price {
        Some(price) => {
            let total = &quantity * &price;
            (Some(price), total)
        }
        None => {
            let total = match (&request.total_amount, &request.unit_price) {
                (Some(total), _) => total.clone(),
                (None, Some(unit_price)) => &quantity * unit_price,
                (None, None) => BigDecimal::from(0),
            };
            (request.unit_price.clone(), total)
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use std::str::FromStr;
    use tower::ServiceExt;

    fn request(json: serde_json::Value) -> CreateTransactionRequest {
        serde_json::from_value(json).unwrap()
    }

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn unconnected_state() -> AppState {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://localhost/unused");
        AppState {
            pool: Pool::builder().build_unchecked(config),
        }
    }

    #[test]
    fn catalog_price_applies_to_unpriced_sales() {
        let sale = request(serde_json::json!({"product_id": 3}));
        assert!(uses_catalog_price("sale", &sale));
        assert!(uses_catalog_price("trade_in", &sale));
        assert!(!uses_catalog_price("refund", &sale));

        let priced = request(serde_json::json!({"product_id": 3, "unit_price": "5.00"}));
        assert!(!uses_catalog_price("sale", &priced));
    }

    #[test]
    fn catalog_price_is_multiplied_by_quantity() {
        let sale = request(serde_json::json!({"product_id": 3, "quantity": 3, "total_amount": "1.00"}));
        let (unit_price, total) = resolve_amounts(&sale, Some(dec("19.99")));
        assert_eq!(unit_price, Some(dec("19.99")));
        assert_eq!(total, dec("59.97"));
    }

    #[test]
    fn explicit_amounts_are_kept() {
        let refund = request(serde_json::json!({"unit_price": "19.99", "total_amount": "-19.99"}));
        let (unit_price, total) = resolve_amounts(&refund, None);
        assert_eq!(unit_price, Some(dec("19.99")));
        assert_eq!(total, dec("-19.99"));

        let repair = request(serde_json::json!({"unit_price": "50", "quantity": 2}));
        assert_eq!(resolve_amounts(&repair, None).1, dec("100"));

        let free = request(serde_json::json!({}));
        assert_eq!(resolve_amounts(&free, None), (None, dec("0")));
    }

    #[tokio::test]
    async fn health_check_responds_ok() {
        let app = create_router(unconnected_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn transaction_type_is_required() {
        let app = create_router(unconnected_state());
        let response = app
            .oneshot(
                Request::post("/api/transactions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"product_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
