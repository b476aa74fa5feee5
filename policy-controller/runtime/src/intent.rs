use crate::{
    queue::{QueueError, Submitter},
    reconcile::{Completion, Outcome, Trigger},
    Error,
};
use anyhow::Result;
use futures::{future, prelude::*};
use hyper::{body::HttpBody, http, Body, Request, Response, StatusCode};
use std::{convert::Infallible, net::SocketAddr};
use tracing::{debug, info, instrument, trace, warn};

pub const INTENT_PATH: &str = "/intent";

/// Larger intent bodies are rejected without being read in full.
pub const MAX_INTENT_BYTES: usize = 64 * 1024;

/// Accepts natural-language intents over HTTP and reports how their
/// reconciliation pass ended.
#[derive(Clone, Debug)]
pub struct IntentService {
    queue: Submitter,
}

// === impl IntentService ===

impl IntentService {
    pub fn new(queue: Submitter) -> Self {
        Self { queue }
    }
}

impl tower::Service<Request<Body>> for IntentService {
    type Response = Response<Body>;
    type Error = hyper::Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, hyper::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        trace!(?req);
        if req.uri().path() != INTENT_PATH {
            return Box::pin(future::ok(respond(StatusCode::NOT_FOUND)));
        }
        if req.method() != http::Method::POST {
            let mut rsp = respond(StatusCode::METHOD_NOT_ALLOWED);
            rsp.headers_mut().insert(
                http::header::ALLOW,
                http::HeaderValue::from_static("POST"),
            );
            return Box::pin(future::ok(rsp));
        }

        let queue = self.queue.clone();
        Box::pin(async move {
            let bytes = match read_body(req.into_body()).await? {
                Some(bytes) => bytes,
                None => {
                    debug!(limit = MAX_INTENT_BYTES, "Rejecting oversized intent");
                    return Ok(respond(StatusCode::PAYLOAD_TOO_LARGE));
                }
            };
            let intent = match String::from_utf8(bytes) {
                Ok(intent) if !intent.trim().is_empty() => intent,
                Ok(_) => {
                    debug!("Rejecting empty intent");
                    return Ok(respond(StatusCode::BAD_REQUEST));
                }
                Err(error) => {
                    debug!(%error, "Rejecting intent");
                    return Ok(respond(StatusCode::BAD_REQUEST));
                }
            };

            info!(%intent, "Received intent");
            let result = queue.submit(Trigger::Intent(intent)).await;
            let status = status(&result);
            match result {
                Ok(outcome) => debug!(outcome = outcome.label(), %status, "Intent handled"),
                Err(error) => warn!(%error, "Failed to submit intent"),
            }
            Ok(respond(status))
        })
    }
}

/// Reads a body of at most [`MAX_INTENT_BYTES`], or returns `None` once it
/// is known to be larger.
async fn read_body(mut body: Body) -> Result<Option<Vec<u8>>, hyper::Error> {
    if HttpBody::size_hint(&body).lower() > MAX_INTENT_BYTES as u64 {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > MAX_INTENT_BYTES {
            return Ok(None);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(Some(bytes))
}

fn respond(status: StatusCode) -> Response<Body> {
    let reason = status.canonical_reason().unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(format!("{reason}\n")))
        .expect("intent response must be valid")
}

/// The status reported for a pass. The cause is logged, not returned.
fn status(result: &Result<Outcome, QueueError>) -> StatusCode {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE,
    };
    match outcome {
        Outcome::Done(Completion::Enforced(_) | Completion::NoPrompts | Completion::Deleted) => {
            StatusCode::OK
        }
        Outcome::Requeue(_) => StatusCode::SERVICE_UNAVAILABLE,
        Outcome::Done(Completion::Failed(error)) => match error {
            Error::AmbiguousPod(_)
            | Error::PodNotFound(_)
            | Error::ServiceNotFound(_)
            | Error::Conversion(_)
            | Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::GenerationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Fetch(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Classification(_)
            | Error::GenerationContractViolation(_)
            | Error::GenerationFailed(_)
            | Error::Enforcement { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Serves the intent endpoint until the process begins shutting down.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(addr: SocketAddr, svc: IntentService, drain: drain::Watch) -> Result<()> {
    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let svc = svc.clone();
        future::ok::<_, Infallible>(svc)
    });

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = hyper::Server::try_bind(&addr)?
            .serve(make_svc)
            .with_graceful_shutdown(close_rx.map(|_| {}));
    }

    info!(%addr, "intent server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{Entity, EntityKind},
        queue,
        test_util::{mk_pod, mk_service, reconciler, FakeGenerator, Reply},
    };
    use maplit::btreemap;
    use std::{sync::Arc, time::Duration};
    use tower::Service;

    const DB_POLICY: &str = "Generated text:\n\
        apiVersion: cilium.io/v2\n\
        kind: CiliumNetworkPolicy\n\
        spec:\n\
        \x20 endpointSelector:\n\
        \x20   matchLabels:\n\
        \x20     app: db\n\
        \x20 ingress:\n\
        \x20 - fromEndpoints:\n\
        \x20   - matchLabels:\n\
        \x20       app: web\n\
        \x20   toPorts:\n\
        \x20   - ports:\n\
        \x20     - port: \"5432\"\n\
        \x20       protocol: TCP\n";

    fn web_to_db() -> Vec<Entity> {
        vec![
            Entity::new(EntityKind::Action, "Allow"),
            Entity::new(EntityKind::TrafficDirection, "ingress"),
            Entity::new(EntityKind::PodName, "web"),
            Entity::new(EntityKind::PodName, "db"),
            Entity::new(EntityKind::Port, "5432"),
        ]
    }

    fn service(
        entities: Vec<Entity>,
        reply: Reply,
    ) -> (Arc<crate::cluster::InMemoryCluster>, IntentService, drain::Signal) {
        let (cluster, reconciler) = reconciler(entities, Arc::new(FakeGenerator::new(reply)));
        cluster.add_namespace("default", "Active");
        let db = btreemap! { "app".to_string() => "db".to_string() };
        cluster.add_pod(mk_pod("default", "db-0", db.clone(), &[(5432, Some("TCP"))], &[]));
        cluster.add_service(mk_service("default", "db", db));
        cluster.add_pod(mk_pod(
            "default",
            "web-0",
            btreemap! { "app".to_string() => "web".to_string() },
            &[(80, None)],
            &[("DB_ADDR", "db:5432")],
        ));

        let (submitter, queue) = queue::channel(reconciler, 8, Duration::from_secs(5));
        let (signal, drain) = drain::channel();
        tokio::spawn(queue.run(drain));
        (cluster, IntentService::new(submitter), signal)
    }

    fn post(path: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .body(body.into())
            .unwrap()
    }

    async fn call(svc: &mut IntentService, req: Request<Body>) -> StatusCode {
        svc.call(req).await.unwrap().status()
    }

    #[tokio::test(start_paused = true)]
    async fn enforced_intent_is_ok() {
        let (cluster, mut svc, _signal) = service(web_to_db(), Reply::Fixed(DB_POLICY.to_string()));
        let status = call(
            &mut svc,
            post(INTENT_PATH, "Allow ingress from web pod to db pod on 5432/TCP"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cluster.policies()[0].name, "cnp-allow-db-5432");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (_cluster, mut svc, _signal) = service(web_to_db(), Reply::Hang);
        assert_eq!(call(&mut svc, post("/", "allow")).await, StatusCode::NOT_FOUND);
        assert_eq!(call(&mut svc, post(INTENT_PATH, "")).await, StatusCode::BAD_REQUEST);
        assert_eq!(call(&mut svc, post(INTENT_PATH, " \n")).await, StatusCode::BAD_REQUEST);
        assert_eq!(
            call(&mut svc, post(INTENT_PATH, vec![0xff, 0xfe])).await,
            StatusCode::BAD_REQUEST
        );

        let get = Request::builder().uri(INTENT_PATH).body(Body::empty()).unwrap();
        let rsp = svc.call(get).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(rsp.headers()[http::header::ALLOW], "POST");
    }

    #[tokio::test]
    async fn oversized_intents_are_rejected() {
        let (cluster, mut svc, _signal) = service(web_to_db(), Reply::Hang);
        let sized = post(INTENT_PATH, vec![b'a'; MAX_INTENT_BYTES + 1]);
        assert_eq!(call(&mut svc, sized).await, StatusCode::PAYLOAD_TOO_LARGE);

        // Chunked bodies carry no length and are capped as they are read.
        let (mut tx, body) = Body::channel();
        tokio::spawn(async move {
            for _ in 0..2 {
                let chunk = hyper::body::Bytes::from(vec![b'a'; MAX_INTENT_BYTES / 2 + 1]);
                if tx.send_data(chunk).await.is_err() {
                    return;
                }
            }
        });
        assert_eq!(
            call(&mut svc, post(INTENT_PATH, body)).await,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(cluster.creates(), 0);
    }

    #[tokio::test]
    async fn unresolvable_intent_is_unprocessable() {
        let (_cluster, mut svc, _signal) = service(
            vec![Entity::new(EntityKind::PodName, "pod")],
            Reply::Hang,
        );
        let status = call(&mut svc, post(INTENT_PATH, "Allow traffic to the pod")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_timeout_is_gateway_timeout() {
        let (cluster, mut svc, _signal) = service(web_to_db(), Reply::Hang);
        let status = call(&mut svc, post(INTENT_PATH, "Allow ingress from web to db")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(cluster.creates(), 0);
    }

    #[tokio::test]
    async fn cluster_read_failure_is_unavailable() {
        let (cluster, mut svc, _signal) = service(web_to_db(), Reply::Hang);
        cluster.fail_reads("connection refused");
        let status = call(&mut svc, post(INTENT_PATH, "Allow ingress from web to db")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn contract_violation_is_internal_error() {
        let (_cluster, mut svc, _signal) = service(
            web_to_db(),
            Reply::Script(vec![Err("Traceback".to_string())]),
        );
        let status = call(&mut svc, post(INTENT_PATH, "Allow ingress from web to db")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
