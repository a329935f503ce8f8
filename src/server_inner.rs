use std::path::PathBuf;
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use log::info;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::profile::{Orientation, Quality};
use crate::registry::{Registry, StatusEvent};
use crate::service::{
    self, streamer_server::Streamer, ClearSessionRequest, ClearSessionResponse,
    GetStatusRequest, GetStatusResponse, ListActiveRequest, ListActiveResponse,
    StartSessionRequest, StartSessionResponse, StopSessionRequest, StopSessionResponse,
    WatchStatusRequest,
};
use crate::session::{ConnectionStatus, SessionDescriptor, StatusSnapshot, StreamKey};

pub struct ServerInner {
    registry: Registry,
}

impl ServerInner {
    pub fn new(registry: Registry) -> Self {
        ServerInner { registry }
    }
}

fn quality_from_wire(value: i32) -> Quality {
    match service::Quality::try_from(value) {
        Ok(service::Quality::Low) => Quality::Low,
        Ok(service::Quality::High) => Quality::High,
        // unspecified and unknown tiers share the documented default
        _ => Quality::Medium,
    }
}

fn orientation_from_wire(value: i32) -> Orientation {
    match service::Orientation::try_from(value) {
        Ok(service::Orientation::Portrait) => Orientation::Portrait,
        _ => Orientation::Landscape,
    }
}

fn status_to_wire(status: ConnectionStatus) -> service::ConnectionStatus {
    match status {
        ConnectionStatus::Idle => service::ConnectionStatus::Idle,
        ConnectionStatus::Connecting => service::ConnectionStatus::Connecting,
        ConnectionStatus::Live => service::ConnectionStatus::Live,
        ConnectionStatus::Stopping => service::ConnectionStatus::Stopping,
        ConnectionStatus::Stopped => service::ConnectionStatus::Stopped,
        ConnectionStatus::Failed => service::ConnectionStatus::Failed,
    }
}

impl From<StatusSnapshot> for service::StatusSnapshot {
    fn from(snapshot: StatusSnapshot) -> Self {
        service::StatusSnapshot {
            status: status_to_wire(snapshot.status) as i32,
            upload_rate_mbps: snapshot.upload_rate_mbps,
            dropped_frames: snapshot.dropped_frames,
            elapsed_secs: snapshot.elapsed.map_or(0, |elapsed| elapsed.as_secs()),
            started_at_ms: snapshot
                .started_at
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |since| since.as_millis() as i64),
            last_error: snapshot.last_error.unwrap_or_default(),
        }
    }
}

impl From<StatusEvent> for service::StatusEvent {
    fn from(event: StatusEvent) -> Self {
        service::StatusEvent {
            session_id: event.id,
            snapshot: Some(event.snapshot.into()),
        }
    }
}

impl From<StartSessionRequest> for SessionDescriptor {
    fn from(request: StartSessionRequest) -> Self {
        SessionDescriptor {
            id: request.session_id,
            credential: StreamKey::new(request.stream_key),
            input_path: PathBuf::from(request.input_path),
            quality: quality_from_wire(request.quality),
            orientation: orientation_from_wire(request.orientation),
            loop_input: request.loop_input,
        }
    }
}

type StatusEventStream = Pin<Box<dyn Stream<Item = Result<service::StatusEvent, Status>> + Send>>;

#[tonic::async_trait]
impl Streamer for ServerInner {
    async fn start_session(
        &self,
        request: Request<StartSessionRequest>,
    ) -> Result<Response<StartSessionResponse>, Status> {
        let descriptor = SessionDescriptor::from(request.into_inner());
        info!("start requested for session {}", descriptor.id);

        let snapshot = self.registry.start(descriptor).await?;

        Ok(Response::new(StartSessionResponse {
            snapshot: Some(snapshot.into()),
        }))
    }

    async fn stop_session(
        &self,
        request: Request<StopSessionRequest>,
    ) -> Result<Response<StopSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        info!("stop requested for session {}", session_id);

        self.registry.stop(&session_id).await?;

        Ok(Response::new(StopSessionResponse {}))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let session_id = request.into_inner().session_id;

        let snapshot = self
            .registry
            .status(&session_id)
            .await
            .ok_or_else(|| Status::not_found(format!("no session {}", session_id)))?;

        Ok(Response::new(GetStatusResponse {
            snapshot: Some(snapshot.into()),
        }))
    }

    async fn list_active(
        &self,
        _request: Request<ListActiveRequest>,
    ) -> Result<Response<ListActiveResponse>, Status> {
        let session_ids = self.registry.list_active().await.into_iter().collect();
        Ok(Response::new(ListActiveResponse { session_ids }))
    }

    async fn clear_session(
        &self,
        request: Request<ClearSessionRequest>,
    ) -> Result<Response<ClearSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let cleared = self.registry.clear(&session_id).await?;
        Ok(Response::new(ClearSessionResponse { cleared }))
    }

    type WatchStatusStream = StatusEventStream;

    async fn watch_status(
        &self,
        request: Request<WatchStatusRequest>,
    ) -> Result<Response<Self::WatchStatusStream>, Status> {
        let session_id = request.into_inner().session_id;
        let updates = ReceiverStream::new(self.registry.subscribe().await);

        let stream: StatusEventStream = if session_id.is_empty() {
            Box::pin(updates.map(|event| Ok(event.into())))
        } else {
            // lead with the current state so watchers never start blind
            let current = StatusEvent {
                snapshot: self.registry.status_or_idle(&session_id).await,
                id: session_id.clone(),
            };
            Box::pin(
                tokio_stream::once(current)
                    .chain(updates.filter(move |event| event.id == session_id))
                    .map(|event| Ok(event.into())),
            )
        };

        Ok(Response::new(stream))
    }
}
