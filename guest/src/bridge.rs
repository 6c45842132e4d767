//! Host bridge: the request loop the host controller talks to.
//!
//! Requests arrive as line-delimited JSON envelopes over vsock in
//! production (unix and tcp exist for development). Every request runs on
//! its own task so a sleeping wait never stalls the connection; responses
//! carry the request's sequence number and either a result or a stable
//! error code.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use cocoon_shared::protocol::{
    Request, RequestEnvelope, ResponseBody, ResponseEnvelope, StdioPorts,
};
use cocoon_shared::{CocoonError, CocoonResult, Transport, WireError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::GuestCore;
use crate::stdio::ConnectionSet;

/// Serve requests forever on the given transport.
pub async fn serve(
    core: Arc<GuestCore>,
    listen: Transport,
    notify: Option<Transport>,
) -> CocoonResult<()> {
    info!(listen = %listen, "serving host requests");

    match listen {
        Transport::Vsock { port } => {
            use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};

            let addr = VsockAddr::new(VMADDR_CID_ANY, port);
            let mut listener =
                VsockListener::bind(addr).map_err(|e| CocoonError::os("bind vsock", e))?;
            spawn_notify(notify);
            loop {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .map_err(|e| CocoonError::os("accept vsock", e))?;
                debug!(?peer, "host connected");
                tokio::spawn(handle_connection(core.clone(), stream));
            }
        }
        Transport::Unix { socket_path } => {
            if socket_path.exists() {
                std::fs::remove_file(&socket_path)?;
            }
            if let Some(parent) = socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = tokio::net::UnixListener::bind(&socket_path)
                .map_err(|e| CocoonError::os("bind unix socket", e))?;
            spawn_notify(notify);
            loop {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|e| CocoonError::os("accept unix socket", e))?;
                tokio::spawn(handle_connection(core.clone(), stream));
            }
        }
        Transport::Tcp { port } => {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| CocoonError::os("bind tcp", e))?;
            spawn_notify(notify);
            loop {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|e| CocoonError::os("accept tcp", e))?;
                tokio::spawn(handle_connection(core.clone(), stream));
            }
        }
    }
}

/// Dial the notify address once; the connection itself is the readiness
/// signal.
fn spawn_notify(notify: Option<Transport>) {
    let Some(notify) = notify else {
        return;
    };
    tokio::spawn(async move {
        let result = match &notify {
            Transport::Vsock { port } => {
                use tokio_vsock::{VsockAddr, VsockStream, VMADDR_CID_HOST};
                VsockStream::connect(VsockAddr::new(VMADDR_CID_HOST, *port))
                    .await
                    .map(drop)
            }
            Transport::Unix { socket_path } => tokio::net::UnixStream::connect(socket_path)
                .await
                .map(drop),
            Transport::Tcp { port } => tokio::net::TcpStream::connect(("127.0.0.1", *port))
                .await
                .map(drop),
        };
        match result {
            Ok(()) => info!(notify = %notify, "host notified"),
            Err(err) => warn!(notify = %notify, error = %err, "failed to notify host"),
        }
    });
}

async fn handle_connection<S>(core: Arc<GuestCore>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(write));
    let mut lines = BufReader::new(read).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let envelope = match serde_json::from_str::<RequestEnvelope>(&line) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        let error = CocoonError::InvalidArguments(format!(
                            "malformed request: {err}"
                        ));
                        respond(
                            &writer,
                            ResponseEnvelope {
                                seq: 0,
                                result: None,
                                error: Some(WireError::from(&error)),
                            },
                        )
                        .await;
                        continue;
                    }
                };

                let core = core.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let response = dispatch(core, envelope).await;
                    respond(&writer, response).await;
                });
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "host connection read failed");
                break;
            }
        }
    }
    debug!("host connection closed");
}

async fn respond<W>(writer: &Arc<Mutex<WriteHalf<W>>>, response: ResponseEnvelope)
where
    W: AsyncRead + AsyncWrite,
{
    let mut line = match serde_json::to_string(&response) {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "failed to serialize response");
            return;
        }
    };
    line.push('\n');
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write_all(line.as_bytes()).await {
        debug!(error = %err, "failed to write response");
    }
}

async fn dispatch(core: Arc<GuestCore>, envelope: RequestEnvelope) -> ResponseEnvelope {
    let seq = envelope.seq;
    match handle_request(core, envelope.request).await {
        Ok(result) => ResponseEnvelope {
            seq,
            result,
            error: None,
        },
        Err(err) => ResponseEnvelope {
            seq,
            result: None,
            error: Some(WireError::from(&err)),
        },
    }
}

async fn handle_request(
    core: Arc<GuestCore>,
    request: Request,
) -> CocoonResult<Option<ResponseBody>> {
    match request {
        Request::CreateContainer { id, settings } => {
            core.create_container(&id, settings).await?;
            Ok(None)
        }
        Request::ExecProcess { id, params, stdio } => {
            let stdio = connect_stdio(stdio)?;
            let pid = core.exec_process(&id, params, stdio).await?;
            Ok(Some(ResponseBody::Pid { pid }))
        }
        Request::SignalContainer { id, signal } => {
            core.signal_container(&id, signal).await?;
            Ok(None)
        }
        Request::SignalProcess { pid, options } => {
            core.signal_process(pid, options).await?;
            Ok(None)
        }
        Request::ListProcesses { id } => {
            let processes = core.list_processes(&id).await?;
            Ok(Some(ResponseBody::Processes { processes }))
        }
        Request::ModifySettings { id, request } => {
            core.modify_settings(&id, request).await?;
            Ok(None)
        }
        Request::ResizeConsole { pid, height, width } => {
            core.resize_console(pid, height, width).await?;
            Ok(None)
        }
        Request::WaitContainer { id } => {
            let exit_code = core.wait_container(&id).await?;
            Ok(Some(ResponseBody::ExitCode { exit_code }))
        }
        Request::WaitProcess { pid } => {
            let exit_code = core.wait_process(pid).await?;
            Ok(Some(ResponseBody::ExitCode { exit_code }))
        }
        Request::RunExternalProcess { params, stdio } => {
            let stdio = connect_stdio(stdio)?;
            let pid = core.run_external_process(params, stdio).await?;
            Ok(Some(ResponseBody::Pid { pid }))
        }
    }
}

/// Dial back the host's stdio ports, if any.
fn connect_stdio(ports: Option<StdioPorts>) -> CocoonResult<ConnectionSet> {
    let Some(ports) = ports else {
        return Ok(ConnectionSet::empty());
    };
    Ok(ConnectionSet::new(
        ports.stdin.map(dial_host_port).transpose()?,
        ports.stdout.map(dial_host_port).transpose()?,
        ports.stderr.map(dial_host_port).transpose()?,
    ))
}

fn dial_host_port(port: u32) -> CocoonResult<OwnedFd> {
    use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, VsockAddr};
    use std::os::fd::AsRawFd;

    let fd = socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| CocoonError::os("vsock socket", e))?;
    let addr = VsockAddr::new(nix::libc::VMADDR_CID_HOST, port);
    connect(fd.as_raw_fd(), &addr)
        .map_err(|e| CocoonError::os(format!("vsock connect to port {port}"), e))?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oslayer::mock::MockOs;
    use crate::runtime::mock::MockRuntime;
    use tokio::io::AsyncBufReadExt;

    async fn start_bridge() -> (tokio::net::UnixStream, Arc<MockRuntime>) {
        let runtime = MockRuntime::new();
        let os = Arc::new(MockOs::new());
        let core = GuestCore::new(runtime.clone(), os);

        let path = std::env::temp_dir().join(format!("cocoon-bridge-{}.sock", uuid::Uuid::new_v4()));
        let listen = Transport::Unix {
            socket_path: path.clone(),
        };
        tokio::spawn(serve(core, listen, None));

        // The listener comes up asynchronously.
        for _ in 0..200 {
            if let Ok(stream) = tokio::net::UnixStream::connect(&path).await {
                return (stream, runtime);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("bridge never came up at {}", path.display());
    }

    async fn round_trip(
        stream: &mut tokio::net::UnixStream,
        request: &str,
    ) -> ResponseEnvelope {
        let (read, mut write) = stream.split();
        write.write_all(request.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(read).read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn create_and_error_codes_cross_the_wire() {
        let (mut stream, _runtime) = start_bridge().await;

        let resp = round_trip(
            &mut stream,
            r#"{"seq":1,"op":"create_container","id":"web","settings":{}}"#,
        )
        .await;
        assert_eq!(resp.seq, 1);
        assert!(resp.error.is_none());

        let resp = round_trip(
            &mut stream,
            r#"{"seq":2,"op":"create_container","id":"web","settings":{}}"#,
        )
        .await;
        assert_eq!(resp.seq, 2);
        assert_eq!(resp.error.unwrap().code, "container_exists");

        let resp = round_trip(
            &mut stream,
            r#"{"seq":3,"op":"signal_container","id":"missing","signal":9}"#,
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "container_does_not_exist");

        let resp = round_trip(&mut stream, r#"{"seq":4,"op":"no_such_op"}"#).await;
        assert_eq!(resp.seq, 0);
        assert_eq!(resp.error.unwrap().code, "invalid_arguments");
    }

    #[tokio::test]
    async fn waits_do_not_block_the_connection() {
        let (mut stream, runtime) = start_bridge().await;

        let resp = round_trip(
            &mut stream,
            r#"{"seq":1,"op":"create_container","id":"c1","settings":{}}"#,
        )
        .await;
        assert!(resp.error.is_none());

        let spec = serde_json::to_string(&oci_spec::runtime::Spec::default()).unwrap();
        let exec = format!(
            r#"{{"seq":2,"op":"exec_process","id":"c1","params":{{"command_args":["true"],"oci_specification":{spec}}}}}"#
        );
        let resp = round_trip(&mut stream, &exec).await;
        assert!(resp.error.is_none(), "exec failed: {:?}", resp.error);

        // Issue the wait, then let the container exit; the response must
        // arrive even though the wait request slept.
        let (read, mut write) = stream.split();
        write
            .write_all(b"{\"seq\":3,\"op\":\"wait_container\",\"id\":\"c1\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        runtime.container("c1").unwrap().finish(7);

        let mut line = String::new();
        BufReader::new(read).read_line(&mut line).await.unwrap();
        let resp: ResponseEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.seq, 3);
        match resp.result.unwrap() {
            ResponseBody::ExitCode { exit_code } => assert_eq!(exit_code, 7),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
