use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use tracing::{info, level_filters::LevelFilter};

use floodgate::config::ConnectorConfig;
use floodgate::datastream::Datastream;
use floodgate::diag::{DatastreamStateResponse, PositionEntry};
use floodgate::init::{init_tracing, LogFormat};
use floodgate::producer::kafka::KafkaProducerHandle;
use floodgate::producer::SendError;
use floodgate::source::kafka::KafkaSourceAdapter;
use floodgate::source::SourceError;
use floodgate::supervisor::TaskSupervisor;
use floodgate::task::readiness::NoOpTopicReadiness;
use floodgate::task::translate::MirrorTranslator;
use floodgate::task::{ConnectorTask, TaskError};

#[derive(Debug, Clone, serde::Deserialize)]
struct DatastreamQuery {
    datastream: String,
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<TaskSupervisor>,
}

async fn get_datastream_state(
    State(state): State<AppState>,
    Query(query): Query<DatastreamQuery>,
) -> Result<Json<DatastreamStateResponse>, StatusCode> {
    state
        .supervisor
        .datastream_state(&query.datastream)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_position(State(state): State<AppState>) -> Json<Vec<PositionEntry>> {
    Json(state.supervisor.positions())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn mirror_task_factory(
    config: &ConnectorConfig,
) -> impl Fn(&Datastream) -> Result<ConnectorTask, TaskError> {
    let task_config = config.task.clone();

    move |datastream: &Datastream| {
        let adapter =
            KafkaSourceAdapter::from_datastream(datastream, &task_config).map_err(|err| {
                TaskError::Subscribe(SourceError::transient(err.to_string()))
            })?;
        let producer = KafkaProducerHandle::from_datastream(datastream).map_err(|err| {
            TaskError::Producer(SendError::Transient {
                destination: datastream.destination().to_owned(),
                message: err.to_string(),
            })
        })?;
        let translator = MirrorTranslator::from_datastream(datastream)?;

        ConnectorTask::new(
            datastream.clone(),
            task_config.clone(),
            Box::new(adapter),
            Arc::new(producer),
            Box::new(translator),
            Arc::new(NoOpTopicReadiness),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let log_format: LogFormat = env_or("FLOODGATE_LOG_FORMAT", "text")
        .parse()
        .expect("unrecognized FLOODGATE_LOG_FORMAT");
    init_tracing(LevelFilter::INFO, log_format).expect("failed to install tracing subscriber");

    let name = env_or("FLOODGATE_DATASTREAM", "mirror");
    let source = env_or("FLOODGATE_SOURCE", "kafka://localhost:9092/^.*$");
    let destination = env_or("FLOODGATE_DESTINATION", "kafka://localhost:9093/%s");
    let listen = env_or("FLOODGATE_LISTEN", "0.0.0.0:8080");

    let config: ConnectorConfig = match std::env::var("FLOODGATE_CONFIG") {
        Ok(raw) => serde_json::from_str(&raw).expect("FLOODGATE_CONFIG is not valid JSON"),
        Err(_) => ConnectorConfig::default(),
    };
    config.validate().expect("invalid connector configuration");

    let factory = mirror_task_factory(&config);
    let supervisor = Arc::new(TaskSupervisor::new(
        "kafka-mirror",
        config,
        Box::new(factory),
    ));

    supervisor.start();
    supervisor.on_assignment_change(vec![Datastream::new(
        name.clone(),
        "kafka-mirror",
        source,
        destination,
    )]);
    info!("Datastream {} assigned; serving diagnostics on {}", name, listen);

    let routes = axum::Router::new()
        .route("/datastream_state", get(get_datastream_state))
        .route("/position", get(get_position))
        .with_state(AppState {
            supervisor: supervisor.clone(),
        });

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    let result = axum::serve(listener, routes).await;

    supervisor.stop();
    result
}
