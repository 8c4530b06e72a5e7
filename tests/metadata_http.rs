//! Metadata reads against a local HTTP listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bootvol::device::{render_slots, reserved_slots};
use bootvol::test_support::ScriptedProvider;
use bootvol::{
    HttpMetadataClient, InstanceId, MetadataError, MetadataFormat, MetadataSource, VolumeError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serves fixed bodies by request target and records every target asked
/// for. Unknown targets answer 404.
struct MetadataServer {
    base: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MetadataServer {
    async fn start(routes: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener address: {err}"));
        let table: Arc<HashMap<String, String>> = Arc::new(
            routes
                .iter()
                .map(|(target, body)| ((*target).to_owned(), (*body).to_owned()))
                .collect(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let table = Arc::clone(&table);
                let log = Arc::clone(&log);
                tokio::spawn(async move { respond(stream, &table, &log).await });
            }
        });

        Self {
            base: format!("http://{addr}"),
            requests,
        }
    }

    fn url(&self, target: &str) -> String {
        format!("{}{target}", self.base)
    }

    fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn respond(
    mut stream: TcpStream,
    table: &HashMap<String, String>,
    log: &Mutex<Vec<String>>,
) {
    let mut request = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.unwrap_or_default();
        if read == 0 {
            break;
        }
        request.extend_from_slice(chunk.get(..read).unwrap_or_default());
    }

    let head = String::from_utf8_lossy(&request);
    let target = head.split_whitespace().nth(1).unwrap_or("/").to_owned();
    let (status, body) = table
        .get(&target)
        .map_or(("404 Not Found", ""), |body| ("200 OK", body.as_str()));
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(target);

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .unwrap_or_else(|err| panic!("write response: {err}"));
    stream
        .shutdown()
        .await
        .unwrap_or_else(|err| panic!("close connection: {err}"));
}

const EC2_ROUTES: [(&str, &str); 3] = [
    ("/mapping/", "ami\nroot\nebs1\n"),
    ("/mapping/ami", "sda1"),
    ("/mapping/root", "/dev/sda1\n"),
];

fn ec2_client(server: &MetadataServer) -> HttpMetadataClient {
    HttpMetadataClient::new(MetadataFormat::Ec2).with_url(server.url("/mapping"))
}

#[tokio::test]
async fn ec2_listing_reads_every_entry() {
    let mut routes = EC2_ROUTES.to_vec();
    routes.push(("/mapping/ebs1", "sdb"));
    let server = MetadataServer::start(&routes).await;

    let names = ec2_client(&server)
        .boot_device_names()
        .await
        .unwrap_or_else(|err| panic!("mapping should be readable: {err}"));

    assert_eq!(names, vec!["sda1", "/dev/sda1", "sdb"]);
    assert_eq!(
        server.requests(),
        vec!["/mapping/", "/mapping/ami", "/mapping/root", "/mapping/ebs1"]
    );
}

#[tokio::test]
async fn missing_ec2_entry_is_a_status_error() {
    let server = MetadataServer::start(&EC2_ROUTES).await;

    let err = ec2_client(&server)
        .boot_device_names()
        .await
        .expect_err("ebs1 is not served");

    assert_eq!(
        err,
        MetadataError::Status {
            url: server.url("/mapping/ebs1"),
            status: 404,
        }
    );
}

#[tokio::test]
async fn missing_ec2_entry_makes_metadata_unavailable() {
    let server = MetadataServer::start(&EC2_ROUTES).await;
    let provider = ScriptedProvider::new();

    let err = reserved_slots(&provider, &ec2_client(&server), &InstanceId::from("i-123"))
        .await
        .expect_err("ebs1 is not served");

    assert!(matches!(
        err,
        VolumeError::MetadataUnavailable(MetadataError::Status { status: 404, .. })
    ));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn scaleway_conf_reserves_indexed_volumes() {
    let conf = r#"{
        "id": "11111111-2222-3333-4444-555555555555",
        "volumes": {
            "0": {"id": "root-vol", "volume_type": "l_ssd"},
            "1": {"id": "data-vol", "volume_type": "b_ssd"}
        }
    }"#;
    let server = MetadataServer::start(&[("/conf?format=json", conf)]).await;
    let client = HttpMetadataClient::new(MetadataFormat::Scaleway)
        .with_url(server.url("/conf?format=json"));

    let reserved = reserved_slots(&ScriptedProvider::new(), &client, &InstanceId::from("srv"))
        .await
        .unwrap_or_else(|err| panic!("conf should be readable: {err}"));

    assert_eq!(render_slots(&reserved), vec!["sda", "sdb"]);
    assert_eq!(server.requests(), vec!["/conf?format=json"]);
}

#[tokio::test]
async fn scaleway_conf_error_page_is_reported() {
    let server = MetadataServer::start(&[]).await;
    let client = HttpMetadataClient::new(MetadataFormat::Scaleway)
        .with_url(server.url("/conf?format=json"));

    let err = client
        .boot_device_names()
        .await
        .expect_err("conf is not served");

    assert!(matches!(err, MetadataError::Status { status: 404, .. }));
}
