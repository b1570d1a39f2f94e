use crate::metrics::MetricRegistry;
use rocket::config::{LogLevel, Shutdown};
use rocket::http::{ContentType, Status};
use rocket::{get, routes, Build, Rocket, State};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub struct WebServer {
    pub name: String,
    pub port: u16,
    pub metrics: Arc<MetricRegistry>,
    pub shutdown: watch::Receiver<bool>,
}

#[get("/metrics")]
fn metrics(registry: &State<Arc<MetricRegistry>>) -> std::result::Result<(ContentType, String), Status> {
    match registry.render() {
        Ok(text) => Ok((ContentType::Plain, text)),
        Err(e) => {
            error!("webserver: cannot encode metrics: {}", e);
            Err(Status::InternalServerError)
        }
    }
}

pub fn build(registry: Arc<MetricRegistry>, config: rocket::Config) -> Rocket<Build> {
    rocket::custom(config)
        .mount("/", routes![metrics])
        .manage(registry)
}

//an unhandled rocket error panics on drop, kind() marks it handled
fn launch_error(e: rocket::Error) -> Box<dyn std::error::Error + Send + Sync> {
    format!("cannot start HTTP server: {}", e.kind()).into()
}

impl WebServer {
    fn config(&self) -> rocket::Config {
        rocket::Config {
            port: self.port,
            address: Ipv4Addr::UNSPECIFIED.into(),
            log_level: LogLevel::Critical,
            //termination is driven by our own signal handler
            shutdown: Shutdown {
                ctrlc: false,
                #[cfg(unix)]
                signals: HashSet::new(),
                ..Default::default()
            },
            ..rocket::Config::default()
        }
    }

    pub async fn worker(&mut self) -> Result<()> {
        info!("{}: Starting task, listening on port {}", self.name, self.port);

        let rocket = build(self.metrics.clone(), self.config())
            .ignite()
            .await
            .map_err(launch_error)?;

        let handle = rocket.shutdown();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            handle.notify();
        });

        let _rocket = rocket.launch().await.map_err(launch_error)?;

        info!("{}: task stopped", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PollResult;
    use rocket::local::blocking::Client;

    fn client(registry: Arc<MetricRegistry>) -> Client {
        Client::tracked(build(registry, rocket::Config::debug_default())).unwrap()
    }

    #[test]
    fn serves_prometheus_text() {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        registry.record_poll(PollResult::Ok);

        let client = client(registry);
        let response = client.get("/metrics").dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), Some(ContentType::Plain));
        let body = response.into_string().unwrap();
        assert!(body.contains("# TYPE hoymiles_exporter_polls_total counter"));
        assert!(body.contains("hoymiles_exporter_polls_total{result=\"ok\"} 1"));
    }

    #[test]
    fn unknown_path_is_not_found() {
        let client = client(Arc::new(MetricRegistry::new().unwrap()));
        assert_eq!(client.get("/").dispatch().status(), Status::NotFound);
    }
}
