//! End-to-end tests for the gRPC-Web channel: local tonic client → in-process
//! pipe → outbound HTTP/1.1 → downgrading handler → echo service, with the
//! response transcoded back from gRPC-Web.

use std::{convert::Infallible, net::SocketAddr};

use bytes::Bytes;
use downgrpc_tokio_client::{connect_via_proxy, ConnectOptions};
use downgrpc_tokio_server::{DowngradingHandler, MethodKind};
use example_echo_service::{
    pb::{echo_client::EchoClient, echo_server::EchoServer, EchoRequest},
    EchoService, ECHO_METHODS,
};
use http::{header::HOST, Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use tokio::net::{TcpListener, TcpStream};
use tonic::Code;

fn echo_methods() -> impl Iterator<Item = (&'static str, MethodKind)> {
    ECHO_METHODS.iter().map(|(path, client_streaming)| {
        let kind = if *client_streaming {
            MethodKind::ClientStreaming
        } else {
            MethodKind::Unary
        };
        (*path, kind)
    })
}

async fn serve_echo() -> SocketAddr {
    let handler = DowngradingHandler::builder(tower::service_fn(
        |_req: Request<Incoming>| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"fallback"))))
        },
    ))
    .add_service(EchoServer::new(EchoService), echo_methods())
    .build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let service = TowerToHyperService::new(handler.clone());
            tokio::spawn(async move {
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// A deliberately dumb HTTP/1.1 reverse proxy: one upstream connection per
/// request, origin-form request target, no trailer support whatsoever. This
/// is the kind of intermediary the bridge exists to cross.
async fn serve_http1_reverse_proxy(target: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let service = hyper::service::service_fn(move |mut req: Request<Incoming>| async move {
                let upstream = TcpStream::connect(target).await.unwrap();
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(upstream))
                        .await
                        .unwrap();
                tokio::spawn(conn);

                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .to_owned();
                *req.uri_mut() = path_and_query.parse::<Uri>().unwrap();
                req.headers_mut()
                    .insert(HOST, target.to_string().parse().unwrap());

                let response = sender.send_request(req).await.unwrap();
                Ok::<_, Infallible>(response)
            });
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn unary_echo_via_grpc_web_proxy() {
    let addr = serve_echo().await;
    let channel = connect_via_proxy(addr.to_string(), None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let mut request = tonic::Request::new(EchoRequest {
        message: "x".to_owned(),
    });
    request
        .metadata_mut()
        .insert("header-echo", "H".parse().unwrap());

    let response = client.unary_echo(request).await.unwrap();
    assert_eq!(
        response.metadata().get("header-echo-response").unwrap(),
        "H"
    );
    assert_eq!(response.into_inner().message, "x");

    // The channel multiplexes further RPCs over the same pipe.
    let again = client
        .unary_echo(tonic::Request::new(EchoRequest {
            message: "again".to_owned(),
        }))
        .await
        .unwrap();
    assert_eq!(again.into_inner().message, "again");
}

#[tokio::test]
async fn unary_echo_through_an_http1_reverse_proxy_hop() {
    let grpc_addr = serve_echo().await;
    let proxy_addr = serve_http1_reverse_proxy(grpc_addr).await;

    let channel = connect_via_proxy(proxy_addr.to_string(), None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let mut request = tonic::Request::new(EchoRequest {
        message: "x".to_owned(),
    });
    request
        .metadata_mut()
        .insert("header-echo", "H".parse().unwrap());

    let response = client.unary_echo(request).await.unwrap();
    assert_eq!(
        response.metadata().get("header-echo-response").unwrap(),
        "H"
    );
    assert_eq!(response.into_inner().message, "x");
}

#[tokio::test]
async fn server_streaming_with_trailers_via_grpc_web() {
    let addr = serve_echo().await;
    let channel = connect_via_proxy(addr.to_string(), None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let mut request = tonic::Request::new(EchoRequest {
        message: "HEADERS\na\nb\nc".to_owned(),
    });
    request
        .metadata_mut()
        .insert("header-echo", "H".parse().unwrap());

    let response = client.server_streaming_echo(request).await.unwrap();
    assert_eq!(
        response.metadata().get("header-echo-response").unwrap(),
        "H"
    );

    let mut stream = response.into_inner();
    let mut messages = Vec::new();
    while let Some(msg) = stream.message().await.unwrap() {
        messages.push(msg.message);
    }
    // Completion implies the trailer frame made it back through the
    // transcoder; a lost trailer surfaces as an RPC error above.
    assert_eq!(messages, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn error_via_header_carries_status_and_trailers() {
    let addr = serve_echo().await;
    let channel = connect_via_proxy(addr.to_string(), None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let mut request = tonic::Request::new(EchoRequest {
        message: "x".to_owned(),
    });
    request.metadata_mut().insert("error", "E".parse().unwrap());
    request
        .metadata_mut()
        .insert("trailer-echo", "T".parse().unwrap());

    let status = client.unary_echo(request).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "E");
    assert_eq!(
        status.metadata().get("trailer-echo-response").unwrap(),
        "T"
    );
}

#[tokio::test]
async fn client_streaming_is_rejected_over_grpc_web() {
    let addr = serve_echo().await;
    let channel = connect_via_proxy(addr.to_string(), None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let requests = tokio_stream::iter(vec![
        EchoRequest {
            message: "a".to_owned(),
        },
        EchoRequest {
            message: "b".to_owned(),
        },
    ]);

    let status = client.client_streaming_echo(requests).await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn dial_failure_synthesizes_unavailable() {
    // Nothing listens here; the reverse proxy turns the dial error into a
    // trailers-only UNAVAILABLE response instead of tearing the channel.
    let channel = connect_via_proxy("127.0.0.1:1", None, ConnectOptions::new())
        .await
        .unwrap();
    let mut client = EchoClient::new(channel);

    let status = client
        .unary_echo(tonic::Request::new(EchoRequest {
            message: "x".to_owned(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(status.message().starts_with("transport:"), "{status:?}");
}
