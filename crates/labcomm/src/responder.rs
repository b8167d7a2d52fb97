//! The kernel side of the protocol.
//!
//! [`Responder`] answers requests by delegating to a [`Backend`] and replies
//! in the flat shape kernels use: `{"action": ..., "error": null, ...fields}`.
//! File-existence checks are answered locally.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use labcomm_protocol::{ActionKind, Envelope, StatusRecord};
use log::{debug, error, warn};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::line_transport::is_blank;

/// What the responder needs from the compute backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn status(&self) -> anyhow::Result<StatusRecord>;

    /// Start the backend. Must succeed without side effects if already running.
    async fn start(&self) -> anyhow::Result<()>;

    /// Convert a notebook, returning the path of the written live script.
    async fn convert(&self, ipynb_file_path: &Path, mlx_file_path: &Path)
        -> anyhow::Result<PathBuf>;

    /// Open a live script in the backend's editor.
    async fn edit(&self, mlx_file_path: &Path) -> anyhow::Result<()>;
}

pub struct Responder<B> {
    backend: B,
}

impl<B: Backend> Responder<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build the response to one request. Never fails: errors go in `error`.
    pub async fn respond(&self, request: &Envelope) -> Envelope {
        let kind = match request.kind() {
            Ok(kind) if kind.is_caller_initiated() => kind,
            _ => {
                warn!("[labcomm-responder] Unknown action: {}", request.action);
                return Envelope {
                    action: request.action.clone(),
                    data: Value::Null,
                    request_id: request.request_id.clone(),
                    extra: fields(json!({ "error": "Unknown action" })),
                };
            }
        };
        debug!("[labcomm-responder] Received {}", kind);

        let payload = request.payload();
        let response = match kind {
            ActionKind::StatusQuery => match self.backend.status().await {
                Ok(status) => json!({ "matlabStatus": status, "error": null }),
                Err(e) => {
                    error!("[labcomm-responder] Error fetching status: {:#}", e);
                    json!({ "matlabStatus": {}, "error": e.to_string() })
                }
            },
            ActionKind::StartBackend => error_only(kind, self.backend.start().await),
            ActionKind::CheckFileExists => match path_field(&payload, "mlxFilePath") {
                Some(path) => json!({ "exists": expand_home(path).exists(), "error": null }),
                None => json!({
                    "exists": false,
                    "error": "No file path provided for checking if it exists"
                }),
            },
            ActionKind::Convert => match (
                path_field(&payload, "ipynbFilePath"),
                path_field(&payload, "mlxFilePath"),
            ) {
                (Some(ipynb), Some(mlx)) => {
                    let converted = self
                        .backend
                        .convert(&expand_home(ipynb), &expand_home(mlx))
                        .await;
                    match converted {
                        Ok(path) => json!({ "mlxFilePath": path, "error": null }),
                        Err(e) => {
                            error!("[labcomm-responder] Convert failed: {:#}", e);
                            json!({ "mlxFilePath": null, "error": e.to_string() })
                        }
                    }
                }
                _ => json!({
                    "mlxFilePath": null,
                    "error": "Need both an ipynb and an mlx file path to convert"
                }),
            },
            ActionKind::Edit => match path_field(&payload, "mlxFilePath") {
                Some(path) => error_only(kind, self.backend.edit(&expand_home(path)).await),
                None => json!({ "error": "Need mlx file to open..." }),
            },
            ActionKind::Nudge => json!({ "error": "Unknown action" }),
        };

        Envelope::flat(kind, request.request_id.clone(), fields(response))
    }

    /// A nudge pushed to the front end.
    pub fn nudge(message: impl Into<String>) -> Envelope {
        Envelope::flat(
            ActionKind::Nudge,
            None,
            fields(json!({ "msg": message.into() })),
        )
    }
}

/// Answer requests read from `reader` until it closes.
pub async fn serve<R, W, B>(reader: R, writer: W, responder: Arc<Responder<B>>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    B: Backend + 'static,
{
    serve_with_nudges(reader, writer, responder, None).await
}

/// Like [`serve`], also writing a nudge for every message received on `nudges`.
///
/// Requests are answered concurrently; responses are written as they
/// complete. Responses still in flight when the reader closes are written
/// before returning.
pub async fn serve_with_nudges<R, W, B>(
    reader: R,
    mut writer: W,
    responder: Arc<Responder<B>>,
    mut nudges: Option<mpsc::UnboundedReceiver<String>>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    B: Backend + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let mut reader = BufReader::new(reader);
    // Partial reads survive other branches winning the select
    let mut line = Vec::new();
    let mut nudges_open = nudges.is_some();

    loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut line) => {
                let eof = read? == 0;
                if !is_blank(&line) {
                    match Envelope::from_slice(&line) {
                        Ok(request) => {
                            let responder = responder.clone();
                            let out_tx = out_tx.clone();
                            tokio::spawn(async move {
                                let _ = out_tx.send(responder.respond(&request).await);
                            });
                        }
                        Err(e) => warn!("[labcomm-responder] Skipping malformed line: {}", e),
                    }
                }
                line.clear();
                if eof {
                    break;
                }
            }
            Some(response) = out_rx.recv() => {
                writer.write_all(response.to_line()?.as_bytes()).await?;
                writer.flush().await?;
            }
            message = next_nudge(&mut nudges), if nudges_open => match message {
                Some(message) => {
                    writer.write_all(Responder::<B>::nudge(message).to_line()?.as_bytes()).await?;
                    writer.flush().await?;
                }
                None => nudges_open = false,
            },
        }
    }

    drop(out_tx);
    while let Some(response) = out_rx.recv().await {
        writer.write_all(response.to_line()?.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn next_nudge(nudges: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match nudges {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn error_only(kind: ActionKind, result: anyhow::Result<()>) -> Value {
    match result {
        Ok(()) => json!({ "error": null }),
        Err(e) => {
            error!("[labcomm-responder] {} failed: {:#}", kind, e);
            json!({ "error": e.to_string() })
        }
    }
}

fn path_field<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use labcomm_protocol::{ActionRequest, ActionResponse, BackendState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        edits: Mutex<Vec<PathBuf>>,
        fail_convert: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn status(&self) -> anyhow::Result<StatusRecord> {
            Ok(StatusRecord {
                status: BackendState::Up,
                is_licensed: true,
            })
        }

        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn convert(&self, _ipynb: &Path, mlx: &Path) -> anyhow::Result<PathBuf> {
            if self.fail_convert {
                anyhow::bail!("ipynb2mlx failed");
            }
            Ok(mlx.to_path_buf())
        }

        async fn edit(&self, mlx: &Path) -> anyhow::Result<()> {
            self.edits.lock().unwrap().push(mlx.to_path_buf());
            Ok(())
        }
    }

    fn request(req: ActionRequest) -> Envelope {
        Envelope::request(&req, "nb-1:3")
    }

    fn parse(env: &Envelope) -> Result<ActionResponse, labcomm_protocol::ProtocolError> {
        ActionResponse::parse(env.kind().unwrap(), &env.payload())
    }

    #[tokio::test]
    async fn test_status_response_is_flat_and_tagged() {
        let responder = Responder::new(FakeBackend::default());
        let response = responder.respond(&request(ActionRequest::StatusQuery)).await;

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "matlab_status",
                "requestId": "nb-1:3",
                "matlabStatus": { "status": "up", "isLicensed": true },
                "error": null
            })
        );
    }

    #[tokio::test]
    async fn test_check_file_exists_uses_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("a.mlx");
        std::fs::write(&existing, b"").unwrap();
        let responder = Responder::new(FakeBackend::default());

        let yes = responder
            .respond(&request(ActionRequest::CheckFileExists {
                mlx_file_path: existing.to_string_lossy().into_owned(),
            }))
            .await;
        assert_eq!(parse(&yes).unwrap(), ActionResponse::FileExists(true));

        let no = responder
            .respond(&request(ActionRequest::CheckFileExists {
                mlx_file_path: dir.path().join("b.mlx").to_string_lossy().into_owned(),
            }))
            .await;
        assert_eq!(parse(&no).unwrap(), ActionResponse::FileExists(false));
    }

    #[tokio::test]
    async fn test_check_file_exists_without_path() {
        let responder = Responder::new(FakeBackend::default());
        let env = Envelope::from_line(r#"{"action": "check_file_exists", "data": {}}"#).unwrap();
        let response = responder.respond(&env).await;
        assert_eq!(
            response.payload()["error"],
            "No file path provided for checking if it exists"
        );
        assert_eq!(response.payload()["exists"], false);
    }

    #[tokio::test]
    async fn test_convert_failure_has_null_path() {
        let responder = Responder::new(FakeBackend {
            fail_convert: true,
            ..FakeBackend::default()
        });
        let response = responder
            .respond(&request(ActionRequest::Convert {
                ipynb_file_path: "/w/a.ipynb".into(),
                mlx_file_path: "/w/a.mlx".into(),
            }))
            .await;
        assert_eq!(response.payload()["mlxFilePath"], Value::Null);
        assert_eq!(response.payload()["error"], "ipynb2mlx failed");
    }

    #[tokio::test]
    async fn test_edit_expands_home() {
        let responder = Responder::new(FakeBackend::default());
        let response = responder
            .respond(&request(ActionRequest::Edit {
                mlx_file_path: "~/work/a.mlx".into(),
            }))
            .await;
        assert_eq!(parse(&response).unwrap(), ActionResponse::EditOpened);

        let edits = responder.backend().edits.lock().unwrap();
        assert!(edits[0].ends_with("work/a.mlx"));
        if dirs::home_dir().is_some() {
            assert!(!edits[0].to_string_lossy().starts_with('~'));
        }
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let responder = Responder::new(FakeBackend::default());
        let env = Envelope::from_line(r#"{"action": "reboot", "requestId": "x:1"}"#).unwrap();
        let response = responder.respond(&env).await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "action": "reboot", "requestId": "x:1", "error": "Unknown action" })
        );
    }

    #[test]
    fn test_nudge_envelope() {
        let env = Responder::<FakeBackend>::nudge("Open as live script?");
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({ "action": "nudge", "msg": "Open as live script?" })
        );
    }

    #[tokio::test]
    async fn test_serve_answers_each_line() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let responder = Arc::new(Responder::new(FakeBackend::default()));
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        let serving = tokio::spawn(serve_with_nudges(
            server_read,
            server_write,
            responder,
            Some(nudge_rx),
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        let line = request(ActionRequest::StartBackend).to_line().unwrap();
        client_write.write_all(line.as_bytes()).await.unwrap();
        let response = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.action, "start_matlab_proxy");
        assert_eq!(response.request_id.as_deref(), Some("nb-1:3"));

        nudge_tx.send("hello".to_string()).unwrap();
        let nudge = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(nudge.kind().unwrap(), ActionKind::Nudge);

        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_skips_invalid_utf8() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let responder = Arc::new(Responder::new(FakeBackend::default()));
        let serving = tokio::spawn(serve(server_read, server_write, responder));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"\xff\xfe bad\n").await.unwrap();
        let line = request(ActionRequest::StatusQuery).to_line().unwrap();
        client_write.write_all(line.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let response = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.action, "matlab_status");

        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/a.mlx"), PathBuf::from("/abs/a.mlx"));
        assert_eq!(expand_home("~user/a.mlx"), PathBuf::from("~user/a.mlx"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/a.mlx"), home.join("a.mlx"));
        }
    }
}
