//! Bundled orchestrations: a city fan-out/fan-in and an order-processing chain.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), duraflow::EngineError> {
//! use duraflow::{samples, Client, Runtime};
//! use std::time::Duration;
//!
//! let rt = Runtime::start(samples::activities(), samples::orchestrations()).await;
//! let client = Client::new(rt.clone());
//! let cities = samples::cities_from_request_body(r#"["Paris","Oslo"]"#);
//! let id = client.start_orchestration_typed(samples::CITY_FAN_OUT, &cities).await?;
//! let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await?;
//! println!("{status:?}");
//! # Ok(())
//! # }
//! ```

use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use crate::{codec, durable_debug, durable_error, durable_info, durable_warn, OrchestrationContext, TaskError};

pub const CITY_FAN_OUT: &str = "CityFanOut";
pub const ORDER_CHAIN: &str = "OrderChain";

pub const PROCESS_CITY: &str = "ProcessCity";
pub const VALIDATE_PAYMENT: &str = "ValidatePayment";
pub const CHECK_INVENTORY: &str = "CheckInventory";
pub const SEND_NOTIFICATION: &str = "SendNotification";

pub const DEFAULT_CITIES: [&str; 3] = ["Tokyo", "Seattle", "London"];
pub const DEFAULT_ORDER_ID: &str = "ORDER-12345";

/// Parse the optional JSON array body of a fan-out start request.
///
/// A blank body means no input. A body that is not a JSON array of strings is
/// logged and also treated as no input, so the start request never fails on
/// it and the orchestration falls back to [`DEFAULT_CITIES`].
pub fn cities_from_request_body(body: &str) -> Option<Vec<String>> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Vec<String>>(body) {
        Ok(cities) => Some(cities),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unparseable request body; defaults will be used");
            None
        }
    }
}

/// Fan out one `ProcessCity` per city and fan in the results in input order.
/// Output is a JSON array of strings.
pub async fn city_fan_out(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let supplied = if input.trim().is_empty() {
        Ok(None)
    } else {
        codec::decode::<Option<Vec<String>>>(&input)
    };
    let cities = match supplied {
        Ok(Some(cities)) if !cities.is_empty() => cities,
        Ok(_) => {
            durable_warn!(ctx, "no cities supplied; using defaults");
            default_cities()
        }
        Err(e) => {
            durable_warn!(ctx, error = %e, "unreadable city list; using defaults");
            default_cities()
        }
    };

    let branches = cities
        .iter()
        .map(|city| ctx.schedule_activity(PROCESS_CITY, city.as_str()))
        .collect();
    let results: Vec<String> = ctx
        .join(branches)
        .await
        .into_iter()
        .collect::<Result<_, TaskError>>()
        .map_err(|e| {
            durable_error!(ctx, error = %e, "city processing failed");
            e
        })?;

    durable_info!(ctx, cities = results.len(), "all cities processed");
    codec::encode(&results)
}

/// Validate payment, check inventory, then notify, each step starting only
/// after the previous one completed. Output is a JSON array of the three
/// step results.
pub async fn order_chain(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let order_id = match codec::decode::<Option<String>>(&input) {
        Ok(Some(id)) if !id.trim().is_empty() => id,
        _ => {
            durable_warn!(ctx, default = DEFAULT_ORDER_ID, "no order id supplied; using default");
            DEFAULT_ORDER_ID.to_string()
        }
    };

    let mut results = Vec::with_capacity(3);
    for step in [VALIDATE_PAYMENT, CHECK_INVENTORY, SEND_NOTIFICATION] {
        durable_debug!(ctx, step, order_id = %order_id, "starting step");
        let out = ctx.schedule_activity(step, order_id.as_str()).await.map_err(|e| {
            durable_error!(ctx, step, error = %e, "step failed");
            e
        })?;
        durable_info!(ctx, step, order_id = %order_id, "step completed");
        results.push(out);
    }
    codec::encode(&results)
}

fn default_cities() -> Vec<String> {
    DEFAULT_CITIES.iter().map(|c| c.to_string()).collect()
}

pub fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(CITY_FAN_OUT, city_fan_out)
        .register(ORDER_CHAIN, order_chain)
        .build()
}

pub fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register(PROCESS_CITY, |city: String| async move {
            tracing::info!(city = %city, "processing city");
            Ok(format!("Processed {city}"))
        })
        .register(VALIDATE_PAYMENT, |order: String| async move {
            Ok(format!("Payment validated for {order}"))
        })
        .register(CHECK_INVENTORY, |order: String| async move {
            Ok(format!("Inventory checked for {order}"))
        })
        .register(SEND_NOTIFICATION, |order: String| async move {
            Ok(format!("Notification sent for {order}"))
        })
        .build()
}
