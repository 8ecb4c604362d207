//! HTTP prediction endpoint over a loaded [`Inferencer`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::data::{DataSet, DataSink};
use crate::inference::Inferencer;
use crate::observability::MetricsCollector;

/// Sinks keyed by the input or output name they record.
pub type TrackingSinks = BTreeMap<String, Arc<dyn DataSink>>;

#[derive(Clone)]
struct ServerState {
    inferencer: Arc<Inferencer>,
    collector: MetricsCollector,
    tracking: Arc<TrackingSinks>,
}

pub struct PredictionServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl PredictionServer {
    /// Binds `listen` and serves on a background thread. For each answered
    /// prediction, every tracked input or output is written to its sink off
    /// the request path.
    pub fn start(
        listen: SocketAddr,
        inferencer: Arc<Inferencer>,
        collector: MetricsCollector,
        tracking: TrackingSinks,
    ) -> Result<Self> {
        for name in tracking.keys() {
            let known = inferencer.input_schema().fields.contains_key(name)
                || inferencer.output_schema().fields.contains_key(name);
            if !known {
                warn!(name = name.as_str(), "Tracking sink matches no input or output");
            }
        }
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<std::result::Result<SocketAddr, String>>();
        let state = ServerState {
            inferencer,
            collector,
            tracking: Arc::new(tracking),
        };

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(format!("failed to build runtime: {err}"))).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(format!("failed to bind {listen}: {err}"))).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    error!(error = %err, "Prediction server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .context("prediction server thread exited before binding")?
            .map_err(|err| anyhow!(err))?;
        info!(%address, "Prediction server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Blocks until the server thread ends.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PredictionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(req: Request<Body>, state: ServerState) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Ok(json_response(
            StatusCode::OK,
            &json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "model": state.inferencer.model().kind(),
                "inputs": state.inferencer.model().inputs(),
                "outputs": state.inferencer.model().outputs(),
            }),
        )),
        (&Method::GET, "/schema") => Ok(json_response(
            StatusCode::OK,
            &json!({
                "request": state.inferencer.input_schema().json_schema(),
                "response": state.inferencer.output_schema().json_schema(),
            }),
        )),
        (&Method::GET, "/metrics") => {
            let body = state.collector.snapshot().to_prometheus();
            Ok(Response::new(Body::from(body)))
        }
        (&Method::GET, "/metrics.json") => {
            let snapshot = serde_json::to_value(state.collector.snapshot()).unwrap_or_default();
            Ok(json_response(StatusCode::OK, &snapshot))
        }
        (&Method::POST, "/predict") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            Ok(predict(&bytes, &state))
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": "Not Found" }),
        )),
    }
}

fn predict(body: &[u8], state: &ServerState) -> Response<Body> {
    let request: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            state.collector.record_prediction(false);
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": format!("invalid JSON body: {err}") }),
            );
        }
    };
    let _timer = state.collector.start_stage("predict");
    match state.inferencer.exchange_json(&request) {
        Ok(exchange) => {
            state.collector.record_prediction(true);
            if !state.tracking.is_empty() {
                track(state.tracking.clone(), exchange.request, exchange.predictions);
            }
            json_response(StatusCode::OK, &exchange.response)
        }
        Err(err) => {
            state.collector.record_prediction(false);
            let status = if err.is_schema_violation() {
                StatusCode::UNPROCESSABLE_ENTITY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            warn!(error = %err, status = status.as_u16(), "Prediction rejected");
            json_response(status, &json!({ "error": err.to_string() }))
        }
    }
}

/// Inputs take precedence over outputs sharing a name. Failures are
/// logged and never reach the client.
fn track(sinks: Arc<TrackingSinks>, request: DataSet, predictions: DataSet) {
    tokio::task::spawn_blocking(move || {
        for (name, sink) in sinks.iter() {
            let Some(data) = request.get(name).or_else(|| predictions.get(name)) else {
                continue;
            };
            if let Err(err) = sink.write(data) {
                warn!(name = name.as_str(), error = %err, "Failed to write to tracking sink");
            }
        }
    });
}

fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, Data, DataSetSource, InMemorySource, MemorySink};
    use crate::experiment::Experiment;
    use crate::model::Model;
    use crate::pipeline::Pipeline;
    use crate::registry::{Parameters, Registry};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn inferencer(folder: &std::path::Path) -> Inferencer {
        let registry = Registry::with_defaults();
        let model = Model::new(
            registry.estimators.factory("mean").unwrap(),
            Parameters::new(),
            vec!["x".into()],
            vec!["y".into()],
            0,
        )
        .unwrap();
        let train = DataSetSource::new()
            .with("x", InMemorySource::new(Column::Float(vec![1.0, 2.0, 3.0])))
            .with("y", InMemorySource::new(Column::Float(vec![2.0, 4.0, 6.0])));
        let mut experiment = Experiment::builder(Pipeline::new(Vec::new()).unwrap(), model)
            .data_source("train", train)
            .output_folder(folder)
            .build()
            .unwrap();
        experiment.run().unwrap();
        Inferencer::from_experiment(experiment).unwrap()
    }

    fn send(address: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn post(address: SocketAddr, body: &str) -> String {
        send(
            address,
            &format!(
                "POST /predict HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
                 Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ),
        )
    }

    #[test]
    fn predict_endpoint_answers_and_tracks_each_name() {
        let temp = tempdir().unwrap();
        let inputs = Arc::new(MemorySink::new());
        let outputs = Arc::new(MemorySink::new());
        let mut tracking = TrackingSinks::new();
        tracking.insert("x".into(), inputs.clone());
        tracking.insert("y".into(), outputs.clone());
        let collector = MetricsCollector::new();
        let mut server = PredictionServer::start(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(inferencer(temp.path())),
            collector.clone(),
            tracking,
        )
        .unwrap();

        let ok = post(server.address(), r#"{"x": [10.0]}"#);
        assert!(ok.starts_with("HTTP/1.1 200"), "{ok}");
        assert!(ok.contains("4.0"));

        let missing = post(server.address(), r#"{"z": [10.0]}"#);
        assert!(missing.starts_with("HTTP/1.1 422"), "{missing}");

        let schema = send(
            server.address(),
            "GET /schema HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(schema.contains("\"request\""));

        let deadline = Instant::now() + Duration::from_secs(5);
        while (inputs.written().is_empty() || outputs.written().is_empty())
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(inputs.written(), vec![Data::Array(Column::Float(vec![10.0]))]);
        assert_eq!(outputs.written(), vec![Data::Array(Column::Float(vec![4.0]))]);
        let snapshot = collector.snapshot();
        assert_eq!((snapshot.predictions, snapshot.prediction_failures), (1, 1));
        server.stop();
    }
}
