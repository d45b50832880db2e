use std::convert::Infallible;
use std::sync::Arc;
use serde::Deserialize;
use warp::Filter;

use super::websocket;
use crate::exam::ExamServer;
use crate::signaling::SignalKind;

#[derive(Debug, Deserialize)]
struct MembershipRequest {
    peer_id: String,
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    from: String,
    #[serde(default)]
    to: Option<String>,
    kind: SignalKind,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    peer_id: String,
}

#[derive(Debug, Deserialize)]
struct ViolationRequest {
    kind: String,
    description: String,
}

/// All routes under /proctor
pub fn proctor_routes(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    health_route()
        .or(config_route())
        .or(join_route(server.clone()))
        .or(leave_route(server.clone()))
        .or(send_route(server.clone()))
        .or(poll_route(server.clone()))
        .or(stats_route(server.clone()))
        .or(add_violation_route(server.clone()))
        .or(clear_violations_route(server.clone()))
        .or(remove_violation_route(server.clone()))
        .or(violation_status_route(server.clone()))
        .or(connections_route(server.clone()))
        .or(events_route(server))
}

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "Proctoring Server",
            "version": "1.0.0"
        }))
    })
}

pub fn config_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "config").and(warp::get()).map(|| {
        use std::env;

        let config = serde_json::json!({
            "STUN_SERVER_URL": env::var("STUN_SERVER_URL").ok(),
            "SIGNALING_POLL_INTERVAL_MS": env::var("SIGNALING_POLL_INTERVAL_MS").ok(),
            "SIGNALING_MESSAGE_MAX_AGE_SECS": env::var("SIGNALING_MESSAGE_MAX_AGE_SECS").ok(),
            "INSTRUCTOR_ENDPOINT_ENABLED": env::var("INSTRUCTOR_ENDPOINT_ENABLED").ok(),
        });

        warp::reply::json(&config)
    })
}

fn join_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "channels" / String / "join")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |channel_id: String, body: MembershipRequest, server: Arc<ExamServer>| async move {
                let reply = match server.join_channel(&channel_id, &body.peer_id).await {
                    Ok(()) => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({
                            "joined": true,
                            "channel_id": channel_id,
                            "peer_id": body.peer_id,
                        })),
                        warp::http::StatusCode::OK,
                    ),
                    Err(e) => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
                        warp::http::StatusCode::BAD_REQUEST,
                    ),
                };
                Ok::<_, Infallible>(reply)
            },
        )
}

fn leave_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "channels" / String / "leave")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |channel_id: String, body: MembershipRequest, server: Arc<ExamServer>| async move {
                server.leave_channel(&channel_id, &body.peer_id).await;
                Ok::<_, Infallible>(warp::reply::json(&serde_json::json!({
                    "left": true,
                    "channel_id": channel_id,
                    "peer_id": body.peer_id,
                })))
            },
        )
}

fn send_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "channels" / String / "send")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |channel_id: String, body: SendRequest, server: Arc<ExamServer>| async move {
                let message = server
                    .send(
                        &channel_id,
                        &body.from,
                        body.to.as_deref(),
                        body.kind,
                        body.payload,
                    )
                    .await;
                Ok::<_, Infallible>(warp::reply::json(&message))
            },
        )
}

fn poll_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "channels" / String / "poll")
        .and(warp::get())
        .and(warp::query::<PollQuery>())
        .and(with_server(server))
        .and_then(
            |channel_id: String, query: PollQuery, server: Arc<ExamServer>| async move {
                let messages = server.poll(&channel_id, &query.peer_id).await;
                Ok::<_, Infallible>(warp::reply::json(&messages))
            },
        )
}

fn stats_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "channels" / String / "stats")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|channel_id: String, server: Arc<ExamServer>| async move {
            let stats = server.stats(&channel_id).await;
            Ok::<_, Infallible>(warp::reply::json(&stats))
        })
}

fn add_violation_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "exams" / String / "students" / String / "violations")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |exam: String, student: String, body: ViolationRequest, server: Arc<ExamServer>| async move {
                server
                    .report_violation(&exam, &student, &body.kind, &body.description)
                    .await;
                let status = server.violation_status(&exam, &student).await;
                Ok::<_, Infallible>(warp::reply::json(&status))
            },
        )
}

fn remove_violation_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "exams" / String / "students" / String / "violations")
        .and(warp::delete())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |exam: String, student: String, body: ViolationRequest, server: Arc<ExamServer>| async move {
                server
                    .resolve_violation(&exam, &student, &body.kind, &body.description)
                    .await;
                let status = server.violation_status(&exam, &student).await;
                Ok::<_, Infallible>(warp::reply::json(&status))
            },
        )
}

fn clear_violations_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "exams" / String / "students" / String / "violations" / "all")
        .and(warp::delete())
        .and(with_server(server))
        .and_then(|exam: String, student: String, server: Arc<ExamServer>| async move {
            server.clear_violations(&exam, &student).await;
            let status = server.violation_status(&exam, &student).await;
            Ok::<_, Infallible>(warp::reply::json(&status))
        })
}

fn violation_status_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "exams" / String / "students" / String / "status")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|exam: String, student: String, server: Arc<ExamServer>| async move {
            let status = server.violation_status(&exam, &student).await;
            Ok::<_, Infallible>(warp::reply::json(&status))
        })
}

fn connections_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "exams" / String / "connections")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|exam: String, server: Arc<ExamServer>| async move {
            let stats = server.instructor_stats(&exam).await;
            Ok::<_, Infallible>(warp::reply::json(&stats))
        })
}

fn events_route(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "events" / String / String)
        .and(warp::ws())
        .and(with_server(server))
        .map(
            |channel_id: String, peer_id: String, ws: warp::ws::Ws, server: Arc<ExamServer>| {
                ws.on_upgrade(move |websocket| {
                    websocket::handle_events_socket(websocket, server, channel_id, peer_id)
                })
            },
        )
}

fn with_server(
    server: Arc<ExamServer>,
) -> impl Filter<Extract = (Arc<ExamServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}
