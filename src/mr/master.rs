use std::{ffi::OsString, path::PathBuf, pin::Pin, process::ExitStatus};

use anyhow::anyhow;
use futures::{FutureExt, future::Shared};
use tokio::{
    net::UnixListener,
    process::Command,
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status, async_trait, transport::Server};

use super::{
    MrError,
    hub::Hub,
    rpc::{master_sock, proto},
};
use crate::config::{ENV_MASTER_SOCK, ENV_RANK, ENV_SIZE};

/// gRPC face of the exchange hub.
#[derive(Clone)]
pub struct MasterServer {
    hub: Hub,
    shutdown_receiver: Shared<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

#[async_trait]
impl proto::master_server::Master for MasterServer {
    async fn join(
        &self,
        request: Request<proto::JoinRequest>,
    ) -> Result<Response<proto::JoinResponse>, Status> {
        let req = request.into_inner();
        self.hub.join(req.rank as usize, req.size as usize).await?;
        let size = self.hub.size().await as u32;
        Ok(Response::new(proto::JoinResponse { size }))
    }

    async fn exchange(
        &self,
        request: Request<proto::ExchangeRequest>,
    ) -> Result<Response<proto::ExchangeResponse>, Status> {
        let req = request.into_inner();
        let rank = req.rank as usize;
        let buffers = tokio::select! {
            res = self.hub.exchange(rank, req.round, req.buckets) => res?,
            _ = self.shutdown_receiver.clone() => {
                return Err(Status::aborted("master shutting down"));
            }
        };
        Ok(Response::new(proto::ExchangeResponse { buffers }))
    }

    async fn abort(&self, request: Request<proto::AbortRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.hub.abort(Some(req.rank as usize), &req.reason).await;
        Ok(Response::new(()))
    }

    async fn leave(&self, request: Request<proto::LeaveRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.hub.leave(req.rank as usize).await?;
        Ok(Response::new(()))
    }
}

impl MasterServer {
    pub fn new<F>(hub: Hub, shutdown_receiver: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown_receiver =
            (Box::pin(shutdown_receiver) as Pin<Box<dyn Future<Output = ()> + Send>>).shared();
        Self {
            hub,
            shutdown_receiver,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Serves the exchange service on `listener` until the shutdown future
    /// resolves.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), anyhow::Error> {
        log::info!("Master serving exchange");
        Server::builder()
            .add_service(
                proto::master_server::MasterServer::new(self.clone())
                    .max_decoding_message_size(usize::MAX)
                    .max_encoding_message_size(usize::MAX),
            )
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                self.shutdown_receiver.clone(),
            )
            .await?;
        log::info!("Master exiting");
        Ok(())
    }
}

/// Launches a group of rank processes and hosts the exchange they share.
pub struct Master {
    size: usize,
    sock: PathBuf,
}

impl Master {
    pub fn new(size: usize, sock: Option<PathBuf>) -> Self {
        Master {
            size,
            sock: sock.unwrap_or_else(master_sock),
        }
    }

    pub async fn run(&self, program: OsString, args: Vec<OsString>) -> Result<(), anyhow::Error> {
        if self.size == 0 {
            return Err(MrError::Usage("a group needs at least one rank".to_string()).into());
        }
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let shutdown_receiver = async move { shutdown_receiver.await.unwrap_or(()) };
        let server = MasterServer::new(Hub::new(self.size), shutdown_receiver);

        // delete master socket if exists
        let _ = std::fs::remove_file(&self.sock);
        let listener = UnixListener::bind(&self.sock)?;

        let ranks = async {
            let res = self.run_ranks(server.hub(), &program, &args).await;
            let _ = shutdown_sender.send(());
            res
        };
        let (served, ranks) = tokio::join!(server.serve(listener), ranks);
        let _ = std::fs::remove_file(&self.sock);
        served?;
        ranks
    }

    async fn run_ranks(
        &self,
        hub: &Hub,
        program: &OsString,
        args: &[OsString],
    ) -> Result<(), anyhow::Error> {
        let (kill_sender, kill_receiver) = watch::channel(false);
        let (status_sender, mut status_receiver) = mpsc::unbounded_channel();

        for rank in 0..self.size {
            let mut child = Command::new(program)
                .args(args)
                .env(ENV_RANK, rank.to_string())
                .env(ENV_SIZE, self.size.to_string())
                .env(ENV_MASTER_SOCK, &self.sock)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| anyhow!("failed to spawn rank {}: {}", rank, e))?;
            log::info!("Rank#{} started as pid {:?}", rank, child.id());

            let mut kill_receiver = kill_receiver.clone();
            let status_sender = status_sender.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = async { let _ = kill_receiver.wait_for(|kill| *kill).await; } => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let _ = status_sender.send((rank, status));
            });
        }
        drop(status_sender);

        let mut failures = Vec::new();
        while let Some((rank, status)) = status_receiver.recv().await {
            match status {
                Ok(status) if status.success() => log::info!("Rank#{} finished", rank),
                status => {
                    let reason = describe_exit(status);
                    log::warn!("Rank#{} failed: {}", rank, reason);
                    if failures.is_empty() {
                        hub.abort(Some(rank), &reason).await;
                        let _ = kill_sender.send(true);
                    }
                    failures.push(format!("rank {rank} {reason}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("group failed: {}", failures.join("; ")))
        }
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "was terminated by a signal".to_string(),
        },
        Err(e) => format!("could not be waited on: {e}"),
    }
}
