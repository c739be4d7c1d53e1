//! Request handlers for the server endpoints

pub mod websocket;

use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::constants::{HEALTH_PATH, WS_PATH};
use crate::core::router::SharedRouter;

pub use websocket::handle_ws_client;

/// All routes served by the realtime endpoint
pub fn routes(
    router: SharedRouter,
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_router(router))
        .and(with_config(config))
        .map(
            |ws: warp::ws::Ws,
             query: HashMap<String, String>,
             router: SharedRouter,
             config: Arc<ServerConfig>|
             -> Box<dyn Reply> {
                let user_id = query.get("user_id").filter(|id| !id.is_empty()).cloned();
                match user_id {
                    Some(user_id) => Box::new(
                        ws.max_message_size(config.max_frame_bytes)
                            .on_upgrade(move |socket| {
                                handle_ws_client(socket, user_id, router, config)
                            }),
                    ),
                    None => Box::new(warp::reply::with_status(
                        warp::reply::json(&json!({ "error": "user_id is required" })),
                        StatusCode::BAD_REQUEST,
                    )),
                }
            },
        );

    let health_route = warp::path(HEALTH_PATH).and(warp::path::end()).map(|| "OK");

    ws_route.or(health_route)
}

fn with_router(router: SharedRouter) -> impl Filter<Extract = (SharedRouter,), Error = Infallible> + Clone {
    warp::any().map(move || router.clone())
}

fn with_config(
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = (Arc<ServerConfig>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}
