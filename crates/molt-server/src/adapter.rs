//! A minimal "hello" application bound through the handoff engine.
//!
//! TCP listeners are served by axum. Unix listeners answer each connection
//! with one greeting line, since axum only serves TCP.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use molt::{Adapter, Address, Grace, Listener};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub struct HttpApp {
    name: String,
    address: Address,
    grace: Option<Arc<Grace>>,
    stop: CancellationToken,
}

#[derive(Clone)]
struct Greeting {
    name: Arc<str>,
}

impl HttpApp {
    pub fn new(name: impl Into<String>, address: Address, stop: CancellationToken) -> Self {
        Self {
            name: name.into(),
            address,
            grace: None,
            stop,
        }
    }

    /// Serve on `listener` until the stop token is cancelled.
    pub async fn run(self, listener: Listener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;

        let role = self
            .grace
            .as_ref()
            .map(|g| g.role().to_string())
            .unwrap_or_else(|| "detached".to_string());
        info!(
            app = %self.name,
            address = %self.address,
            listener = %listener.describe(),
            role = %role,
            "Serving"
        );

        let greeting = Greeting {
            name: Arc::from(self.name.as_str()),
        };

        match listener {
            Listener::Tcp(std_listener) => {
                let listener = tokio::net::TcpListener::from_std(std_listener)?;
                serve_http(listener, greeting, self.stop).await
            }
            Listener::Unix(std_listener) => {
                let listener = tokio::net::UnixListener::from_std(std_listener)?;
                serve_unix(listener, greeting, self.stop).await
            }
        }
    }
}

impl Adapter for HttpApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn attach(&mut self, grace: Arc<Grace>) {
        self.grace = Some(grace);
    }
}

fn greet(name: &str) -> String {
    format!("OK! Hello {}! (pid {})", name, std::process::id())
}

async fn hello(State(greeting): State<Greeting>) -> String {
    greet(&greeting.name)
}

fn router(greeting: Greeting) -> Router {
    Router::new()
        .route("/", get(hello))
        .layer(TraceLayer::new_for_http())
        .with_state(greeting)
}

async fn serve_http(
    listener: tokio::net::TcpListener,
    greeting: Greeting,
    stop: CancellationToken,
) -> Result<()> {
    let name = greeting.name.clone();
    axum::serve(listener, router(greeting))
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            info!(app = %name, "HTTP server received shutdown signal, draining connections");
        })
        .await?;
    Ok(())
}

async fn serve_unix(
    listener: tokio::net::UnixListener,
    greeting: Greeting,
    stop: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!(app = %greeting.name, "Unix listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (mut stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(app = %greeting.name, error = %e, "Accept failed");
                        continue;
                    }
                };
                let line = format!("{}\n", greet(&greeting.name));
                tokio::spawn(async move {
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        debug!(error = %e, "Client went away");
                    }
                    let _ = stream.shutdown().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_unix_app_greets_and_stops() {
        let path = std::env::temp_dir().join(format!("molt-server-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let stop = CancellationToken::new();
        let app = HttpApp::new("demo", Address::unix(&path), stop.clone());
        let listener = Listener::bind(app.address()).unwrap();
        let task = tokio::spawn(app.run(listener));

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("OK! Hello demo!"));

        stop.cancel();
        task.await.unwrap().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_http_app_stops_on_cancel() {
        let stop = CancellationToken::new();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();
        let app = HttpApp::new("web", Address::tcp("127.0.0.1", port), stop.clone());
        let task = tokio::spawn(app.run(Listener::from(std_listener)));

        stop.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("server stopped")
            .unwrap()
            .unwrap();
    }
}
