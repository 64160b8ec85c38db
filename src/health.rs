use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let transcoder_found = std::path::Path::new(&config.transcoder.ffmpeg_path).exists();

    HttpResponse::Ok().json(json!({
        "status": if transcoder_found { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": state.metrics.active_sessions()
        },
        "transcoder": {
            "path": config.transcoder.ffmpeg_path,
            "found": transcoder_found,
            "codec": config.transcoder.codec.as_str()
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let finished = metrics.sessions_completed
        + metrics.sessions_client_closed
        + metrics.sessions_byte_limited
        + metrics.sessions_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "started": metrics.sessions_started,
            "completed": metrics.sessions_completed,
            "client_closed": metrics.sessions_client_closed,
            "byte_limited": metrics.sessions_byte_limited,
            "failed": metrics.sessions_failed,
            "failure_rate": if finished > 0 {
                metrics.sessions_failed as f64 / finished as f64
            } else {
                0.0
            },
            "failures_by_code": metrics.failures_by_code
        },
        "bytes": {
            "received": metrics.bytes_received,
            "forwarded": metrics.bytes_forwarded,
            "delivered": metrics.bytes_delivered
        },
        "chunks_dropped": metrics.chunks_dropped,
        "stream": config.stream,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
