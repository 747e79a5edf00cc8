use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::net::UnixStream;
use tonic::{
    async_trait,
    transport::{Channel, Endpoint, Uri},
};
use tower::service_fn;

use super::{
    MrError,
    comm::Communicator,
    rpc::proto::{self, master_client::MasterClient},
};
use crate::config::GroupConfig;

/// A rank of a multi-process group, talking to the master's exchange service.
pub struct WorkerComm {
    rank: usize,
    size: usize,
    round: AtomicU64,
    client: MasterClient<Channel>,
}

impl WorkerComm {
    pub async fn connect(config: &GroupConfig) -> Result<Self, MrError> {
        let sock_path = config.master_sock.clone();
        let conn = Endpoint::from_static("http://[::1]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let sock_path: PathBuf = sock_path.clone();
                async {
                    let connector = UnixStream::connect(sock_path).await?;
                    let io = hyper_util::rt::TokioIo::new(connector);
                    Ok::<_, std::io::Error>(io)
                }
            }))
            .await?;
        let mut client = MasterClient::new(conn)
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX);

        let joined = client
            .join(proto::JoinRequest {
                rank: config.rank as u32,
                size: config.size as u32,
            })
            .await?
            .into_inner();
        log::info!("Rank#{} joined group of {}", config.rank, joined.size);

        Ok(WorkerComm {
            rank: config.rank,
            size: config.size,
            round: AtomicU64::new(0),
            client,
        })
    }
}

#[async_trait]
impl Communicator for WorkerComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_to_all(&self, buckets: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MrError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        let mut client = self.client.clone();
        log::debug!("Rank#{} entering exchange round {}", self.rank, round);
        let res = client
            .exchange(proto::ExchangeRequest {
                rank: self.rank as u32,
                round,
                buckets,
            })
            .await?
            .into_inner();
        Ok(res.buffers)
    }

    async fn abort(&self, reason: &str) {
        let mut client = self.client.clone();
        let req = proto::AbortRequest {
            rank: self.rank as u32,
            reason: reason.to_string(),
        };
        if let Err(e) = client.abort(req).await {
            log::warn!("Rank#{} could not reach master to abort: {}", self.rank, e);
        }
    }

    async fn finalize(&self) -> Result<(), MrError> {
        let mut client = self.client.clone();
        client
            .leave(proto::LeaveRequest {
                rank: self.rank as u32,
            })
            .await?;
        log::info!("Rank#{} left the group", self.rank);
        Ok(())
    }
}
