//! Handler for `/fdsnws/dataselect/1/query` and `.../queryauth`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::Extension,
    http::{header, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use seisws_delivery::{
    attachment_name, plan_streams, ChannelSink, DeliveryOutcome, DeliveryPipeline, PlanLimits,
};
use seisws_track::TrackStatus;
use seisws_types::{Service, ServiceError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{
    blocking, parse_options, tracker_for, ApiError, Caller, RequestContext, DATASELECT_VERSION,
};
use crate::AppState;

const NO_WAVEFORMS: &str = "no waveform data found";

pub async fn query_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    method: Method,
    uri: Uri,
    body: String,
) -> Result<Response, ApiError> {
    let mut context = RequestContext::new(&uri, DATASELECT_VERSION);
    let mut options = parse_options(Service::DataSelect, &method, &uri, &body)
        .map_err(|e| context.fail(e))?;
    context.no_data = options.no_data;
    options.clamp_windows(
        state
            .dataselect
            .realtime_gap_secs
            .map(chrono::Duration::seconds),
    );

    let tracker = tracker_for(&state, &caller, Service::DataSelect);

    let index = {
        let state = Arc::clone(&state);
        match blocking(move || Ok(state.extents.get()?)).await {
            Ok(index) => index,
            Err(error) => {
                tracker.finish(TrackStatus::Error, 0, &error.to_string());
                return Err(context.fail(error));
            }
        }
    };

    let limits = PlanLimits {
        samples_m: state.dataselect.samples_m,
        archive_networks: state.dataselect.archive_networks.clone(),
    };
    let acl = state.acl.load();
    let streams = plan_streams(
        &options,
        &index,
        caller.identity.as_ref(),
        &acl,
        &limits,
        tracker.as_ref(),
    )
    .map_err(|e| context.fail(e))?;
    tracing::debug!(streams = streams.len(), user = ?caller.user_name, "dataselect planned");

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(state.dataselect.buffer_chunks.max(1));
    let (sink, signals) = ChannelSink::new(tx);
    let pipeline = DeliveryPipeline::new(
        Arc::clone(&state.records),
        state.fetch_pool.clone(),
        state.dataselect.chunk_size,
        tracker,
    );
    let delivery = tokio::spawn(pipeline.run(streams, sink, signals));

    let Some(first) = rx.recv().await else {
        let outcome = delivery
            .await
            .map_err(|e| context.fail(ServiceError::SourceFailure(e.to_string())))?;
        return Err(context.fail(match outcome {
            DeliveryOutcome::Failed { error, .. } => error.into(),
            _ => ServiceError::EmptyResult(NO_WAVEFORMS.to_string()),
        }));
    };

    tokio::spawn(async move {
        match delivery.await {
            Ok(outcome) => tracing::debug!(bytes = outcome.bytes(), "dataselect delivery ended"),
            Err(error) => tracing::error!(%error, "dataselect delivery task failed"),
        }
    });

    let file_name = attachment_name(&state.dataselect.file_name_prefix, &Utc::now());
    let chunks = stream::once(async move { first })
        .chain(ReceiverStream::new(rx))
        .map(Ok::<_, Infallible>);
    let mut response = Body::from_stream(chunks).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.fdsn.mseed"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename={file_name}")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
