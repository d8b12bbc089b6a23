//! Handlers for `/fdsnws/ext/availability/1/{extent,query}`.
//!
//! Extent listings are small and rendered in one go. Segment queries
//! stream: a blocking task scans and merges segments, formats rows into
//! chunks and hands them over a bounded channel to the response body. A
//! client going away closes the channel, which stops the scan.

use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::Extension,
    http::{header, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use seisws_availability::{
    formatter_for, list_extents, plan_segments, render, run_segments, AvailabilityRow,
    NO_AVAILABILITY,
};
use seisws_types::{OutputFormat, RequestOptions, Service, ServiceError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{blocking, parse_options, ApiError, Caller, RequestContext, AVAILABILITY_VERSION};
use crate::AppState;

/// Bytes of formatted rows gathered before a chunk is sent.
const ROW_CHUNK_BYTES: usize = 32 * 1024;

fn file_extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Json => "json",
        OutputFormat::GeoCsv => "csv",
        _ => "txt",
    }
}

fn response_for(options: &RequestOptions, body: Body) -> Response {
    let disposition = format!(
        "inline; filename=fdsnws-ext-availability_{}.{}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
        file_extension(options.format)
    );
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(options.format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// Handler for `GET|POST .../extent` and `.../extentauth`.
pub async fn extent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    method: Method,
    uri: Uri,
    body: String,
) -> Result<Response, ApiError> {
    let mut context = RequestContext::new(&uri, AVAILABILITY_VERSION);
    let options = parse_options(Service::AvailabilityExtent, &method, &uri, &body)
        .map_err(|e| context.fail(e))?;
    context.no_data = options.no_data;

    let rendered = {
        let options = options.clone();
        blocking(move || {
            let index = state.extents.get()?;
            let acl = state.acl.load();
            let rows = list_extents(&index, &options, caller.identity.as_ref(), &acl)?;
            tracing::debug!(rows = rows.len(), "extent listing");
            render(&options, &rows)
        })
        .await
        .map_err(|e| context.fail(e))?
    };

    Ok(response_for(&options, Body::from(rendered)))
}

/// Handler for `GET|POST .../query` and `.../queryauth`.
pub async fn query_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    method: Method,
    uri: Uri,
    body: String,
) -> Result<Response, ApiError> {
    let mut context = RequestContext::new(&uri, AVAILABILITY_VERSION);
    let options = parse_options(Service::AvailabilityQuery, &method, &uri, &body)
        .map_err(|e| context.fail(e))?;
    context.no_data = options.no_data;

    let (index, plan) = {
        let state = Arc::clone(&state);
        let options = options.clone();
        blocking(move || {
            let index = state.extents.get()?;
            let acl = state.acl.load();
            let plan = plan_segments(&index, &options, caller.identity.as_ref(), &acl)?;
            Ok((index, plan))
        })
        .await
        .map_err(|e| context.fail(e))?
    };
    tracing::debug!(extents = plan.extent_count(), "segment query planned");

    let (tx, mut rx) = mpsc::channel::<String>(4);
    let scan = {
        let options = options.clone();
        let segments = Arc::clone(&state.segments);
        tokio::task::spawn_blocking(move || -> Result<u64, ServiceError> {
            let mut formatter = formatter_for(&options)?;
            let mut buffer = String::new();
            let rows = run_segments(segments.as_ref(), &index, &plan, &options, &mut |row| {
                formatter.write_row(&row.line(), &mut buffer);
                if buffer.len() >= ROW_CHUNK_BYTES
                    && tx.blocking_send(std::mem::take(&mut buffer)).is_err()
                {
                    tracing::debug!("client went away, stopping segment scan");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            formatter.finish(&mut buffer);
            if !buffer.is_empty() {
                // A closed channel here only means the client left.
                let _ = tx.blocking_send(buffer);
            }
            Ok(rows)
        })
    };

    let Some(first) = rx.recv().await else {
        let rows = scan
            .await
            .map_err(|e| context.fail(ServiceError::SourceFailure(e.to_string())))?
            .map_err(|e| context.fail(e))?;
        tracing::debug!(rows, "segment query produced no output");
        return Err(context.fail(ServiceError::EmptyResult(NO_AVAILABILITY.to_string())));
    };

    tokio::spawn(async move {
        match scan.await {
            Ok(Ok(rows)) => tracing::debug!(rows, "segment query finished"),
            Ok(Err(error)) => tracing::error!(%error, "segment query failed mid-stream"),
            Err(error) => tracing::error!(%error, "segment query task failed"),
        }
    });

    let chunks = stream::once(async move { first })
        .chain(ReceiverStream::new(rx))
        .map(Ok::<_, Infallible>);
    Ok(response_for(&options, Body::from_stream(chunks)))
}
