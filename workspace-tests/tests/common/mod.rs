#![allow(dead_code)]

use between_agent::config::load_agent_config_with;
use between_agent::{AgentConfig, Args};
use between_core::{
    CommandOutput, CommandRunner, FirewallController, HyperTransport, SystemProbe, ToolMarkers,
    Transport,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Stands in for `pfctl`: answers each call from a script and records it.
#[derive(Default)]
pub struct FakePfctl {
    replies: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakePfctl {
    /// Script a reply for the next unanswered call.
    pub fn then(self, success: bool, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(CommandOutput {
            success,
            text: text.to_string(),
        });
        self
    }

    /// Flags passed on each call, e.g. `["-f -", "-e", "-d"]`.
    pub fn invocations(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(args, _)| args.clone())
            .collect()
    }

    /// Ruleset text submitted with the most recent `-f -`.
    pub fn last_ruleset(&self) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|(_, stdin)| stdin.clone())
    }
}

impl CommandRunner for FakePfctl {
    fn run(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
        let joined = args.join(" ");
        self.calls
            .lock()
            .unwrap()
            .push((joined.clone(), stdin.map(str::to_string)));

        let scripted = self.replies.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| CommandOutput {
            success: true,
            text: match joined.as_str() {
                "-e" => "pf enabled".to_string(),
                "-d" => "pf disabled".to_string(),
                _ => String::new(),
            },
        }))
    }

    fn program(&self) -> &str {
        "pfctl"
    }
}

pub struct CompatibleHost;

impl SystemProbe for CompatibleHost {
    fn is_privileged(&self) -> bool {
        true
    }
    fn platform(&self) -> String {
        "macos".to_string()
    }
    fn find_tool(&self, tool: &str) -> Option<PathBuf> {
        Some(Path::new("/sbin").join(tool))
    }
}

pub fn fake_firewall(pfctl: Arc<FakePfctl>) -> Arc<FirewallController> {
    Arc::new(FirewallController::with_parts(
        pfctl,
        Arc::new(CompatibleHost),
        ToolMarkers::pfctl(),
    ))
}

/// Write a throwaway certificate pair and return its directory.
pub fn cert_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    std::fs::write(dir.path().join("server.crt"), cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(dir.path().join("server.key"), cert.serialize_private_key_pem()).unwrap();
    dir
}

/// Agent config using the certificates in `certs`. Ports default to
/// ephemeral; ports and interface set in `extra` are kept.
pub fn agent_config(certs: &Path, extra: Args) -> AgentConfig {
    let args = Args {
        interface: extra.interface.clone().or_else(|| Some("tap0".to_string())),
        http_port: extra.http_port.or(Some(0)),
        https_port: extra.https_port.or(Some(0)),
        cert_file: Some(certs.join("server.crt")),
        key_file: Some(certs.join("server.key")),
        ..extra
    };
    load_agent_config_with(&args, |_| None).unwrap()
}

/// Upstream client that never consults the host's root store.
pub fn test_transport() -> Arc<dyn Transport> {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    Arc::new(HyperTransport::with_tls_config(config))
}

/// Origin that answers one request and hands back the raw request head.
pub async fn fake_origin(body: &'static str) -> (std::net::SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
    });

    (addr, rx)
}

/// GET `path` through the proxy with `Host` naming the real origin.
pub async fn get_via(proxy: std::net::SocketAddr, host: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept-Encoding: gzip, deflate\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(
        std::time::Duration::from_secs(10),
        stream.read_to_end(&mut response),
    )
    .await
    .expect("proxy did not answer")
    .unwrap();
    String::from_utf8_lossy(&response).to_string()
}
