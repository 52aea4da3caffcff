use ember_server::{HttpResponse, HttpServer, ServerConfig, WsHandlers};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config_path_from_args() {
        Some(path) => ServerConfig::from_json_file(&path)?,
        None => ServerConfig::default(),
    };

    let mut server = HttpServer::new(config)?;
    register_routes(&mut server);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}

fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}

fn register_routes(server: &mut HttpServer) {
    server.add_get_route("/hello", |_| HttpResponse::ok("Hello, World!"));

    let controller = server.controller();
    server.add_get_route("/api/status", move |_| {
        let snapshot = controller.stats();
        HttpResponse::json_response(
            &serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string()),
            ember_server::HttpStatus::Ok,
        )
    });

    server.add_get_route("/greet", |request| {
        let name = request.query_param("name").unwrap_or("Anonymous");
        HttpResponse::ok(&format!("Hello, {name}!"))
    });

    server.add_post_route("/api/data", |request| {
        if request.body.is_empty() {
            return HttpResponse::bad_request("Request body is required");
        }
        let echo = serde_json::json!({
            "received": String::from_utf8_lossy(&request.body),
            "content_type": request.content_type(),
            "content_length": request.content_length(),
        });
        HttpResponse::json_response(&echo.to_string(), ember_server::HttpStatus::Ok)
    });

    server.add_get_route("/user/*", |request| {
        match request.path.rsplit_once('/').map(|(_, id)| id) {
            Some(user_id) if !user_id.is_empty() => {
                let user = serde_json::json!({
                    "id": user_id,
                    "name": format!("User {user_id}"),
                    "email": format!("{user_id}@example.com"),
                });
                HttpResponse::json_response(&user.to_string(), ember_server::HttpStatus::Ok)
            }
            _ => HttpResponse::bad_request("Invalid user ID"),
        }
    });

    server.add_get_route("/dashboard", |_| {
        let mut response = HttpResponse::new(ember_server::HttpStatus::Ok);
        response.set_html(
            "<!DOCTYPE html>\n<html>\n<head><title>ember-http-server</title></head>\n<body>\n\
             <h1>ember-http-server</h1>\n<ul>\n\
             <li><strong>GET</strong> <a href=\"/hello\">/hello</a></li>\n\
             <li><strong>GET</strong> <a href=\"/api/status\">/api/status</a></li>\n\
             <li><strong>GET</strong> <a href=\"/greet?name=Ember\">/greet?name=Ember</a></li>\n\
             <li><strong>GET</strong> /user/{id}</li>\n\
             <li><strong>POST</strong> /api/data</li>\n\
             <li><strong>WS</strong> /ws/echo</li>\n\
             </ul>\n</body>\n</html>\n",
        );
        response
    });

    server.add_websocket_route(
        "/ws/echo",
        WsHandlers::new()
            .on_text(|sender, text| sender.send_text(&format!("Echo: {text}")))
            .on_close(|code, reason| {
                tracing::debug!(code, reason, "websocket peer closed");
            }),
    );
}
