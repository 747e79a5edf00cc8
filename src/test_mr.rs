use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::future::join_all;

use crate::{
    config::{EngineConfig, GroupConfig},
    mr::{
        KeyValue, MRApp, MapReduce, MrError, Phase,
        comm::{Communicator, LocalGroup},
        hub::Hub,
        master::{Master, MasterServer},
        worker::WorkerComm,
    },
    mrapps::pi::{Counts, KEY, Pi},
    mrrt::sequential,
};

type Pairs = Vec<(Vec<u8>, Vec<u8>)>;

fn engine() -> EngineConfig {
    EngineConfig { map_concurrency: 2 }
}

fn local_group(size: usize) -> Vec<Arc<dyn Communicator>> {
    LocalGroup::new(size)
        .into_iter()
        .map(|comm| Arc::new(comm) as Arc<dyn Communicator>)
        .collect()
}

async fn run_pi(comm: Arc<dyn Communicator>, ntasks: u64, samples: u64) -> Result<Pairs, MrError> {
    let app: Arc<dyn MRApp> = Arc::new(Pi::new(samples));
    let mut mr = MapReduce::new(comm.clone(), engine());
    let map_app = app.clone();
    mr.map(ntasks, move |id, kv| map_app.map(id, kv)).await?;
    mr.collate().await?;
    mr.reduce(|key, values, out| app.reduce(key, values, out)).await?;

    let mut pairs = Vec::new();
    mr.scan_kv(|key, value| {
        pairs.push((key.to_vec(), value.to_vec()));
        Ok(())
    })
    .await?;
    comm.finalize().await?;
    Ok(pairs)
}

async fn map_only(comm: Arc<dyn Communicator>, ntasks: u64, samples: u64) -> Pairs {
    let app = Pi::new(samples);
    let mut mr = MapReduce::new(comm, engine());
    mr.map(ntasks, move |id, kv| app.map(id, kv)).await.unwrap();
    mr.kv()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pi_four_tasks_on_one_rank() {
    let pairs = run_pi(Arc::new(LocalGroup::singleton()), 4, 1000).await.unwrap();
    assert_eq!(pairs.len(), 1);
    let (key, value) = &pairs[0];
    assert_eq!(key, &KEY);
    let counts = Counts::from_bytes(value).unwrap();
    assert_eq!(counts.total(), 4000);
    let pi = counts.estimate();
    assert!((2.8..=3.4).contains(&pi), "pi estimate {pi}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pi_across_ranks_matches_sequential() {
    let per_rank = join_all(local_group(3).into_iter().map(|comm| run_pi(comm, 10, 2000))).await;
    let pairs: Pairs = per_rank
        .into_iter()
        .flat_map(|res| res.unwrap())
        .collect();
    // the single key lives on exactly one rank
    assert_eq!(pairs.len(), 1);

    let expected = sequential::run(&Pi::new(2000), 10).unwrap();
    let (key, value) = expected.iter().next().unwrap();
    assert_eq!(pairs[0], (key.to_vec(), value.to_vec()));
    assert_eq!(Counts::from_bytes(value).unwrap().total(), 20_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_output_does_not_depend_on_assignment() {
    let single = map_only(Arc::new(LocalGroup::singleton()), 12, 300).await;
    let split: Pairs = join_all(local_group(4).into_iter().map(|comm| map_only(comm, 12, 300)))
        .await
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(single.len(), 12);
    assert_eq!(single, split);
    let again = map_only(Arc::new(LocalGroup::singleton()), 12, 300).await;
    assert_eq!(single, again);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_tasks_produce_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let per_rank = join_all(local_group(2).into_iter().map(|comm| {
        let calls = calls.clone();
        async move {
            let mut mr = MapReduce::new(comm, engine());
            let map_calls = calls.clone();
            let npairs = mr
                .map(0, move |_, _| {
                    map_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            let ngroups = mr.collate().await.unwrap();
            let nout = mr
                .reduce(|_, _, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            let mut visited = 0;
            mr.scan_kv(|_, _| {
                visited += 1;
                Ok(())
            })
            .await
            .unwrap();
            (npairs, ngroups, nout, visited)
        }
    }))
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for res in per_rank {
        assert_eq!(res, (0, 0, 0, 0));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_keys_group_once_across_ranks() {
    const NTASKS: u64 = 30;
    const NKEYS: u64 = 7;
    let per_rank = join_all(local_group(3).into_iter().map(|comm| async move {
        let mut mr = MapReduce::new(comm, engine());
        mr.map(NTASKS, |id, kv| {
            // two values per task, of different widths
            let key = ((id % NKEYS) as u32).to_le_bytes();
            kv.add(&key, &id.to_le_bytes())?;
            kv.add(&key, &[id as u8])?;
            Ok(())
        })
        .await
        .unwrap();
        mr.collate().await.unwrap();
        let mut groups = Vec::new();
        mr.scan_kmv(|key, values| {
            groups.push((key.to_vec(), values.len(), values.blob().len()));
            Ok(())
        })
        .await
        .unwrap();
        groups
    }))
    .await;

    let mut seen = BTreeMap::new();
    for groups in per_rank {
        for (key, nvalues, nbytes) in groups {
            let key = u32::from_le_bytes(key.try_into().unwrap()) as u64;
            assert!(seen.insert(key, (nvalues, nbytes)).is_none(), "key {key} grouped twice");
        }
    }
    assert_eq!(seen.len(), NKEYS as usize);
    for (key, (nvalues, nbytes)) in seen {
        let ntasks = (0..NTASKS).filter(|id| id % NKEYS == key).count();
        assert_eq!(nvalues, 2 * ntasks);
        assert_eq!(nbytes, 9 * ntasks);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_rank_aborts_the_group() {
    let per_rank = join_all(local_group(3).into_iter().map(|comm| async move {
        let mut mr = MapReduce::new(comm, engine());
        // 9 tasks over 3 ranks: task 4 runs on rank 1
        mr.map(9, |id, kv| {
            anyhow::ensure!(id != 4, "cannot sample task {id}");
            kv.add(b"k", b"v")?;
            Ok(())
        })
        .await?;
        mr.collate().await?;
        Ok::<_, MrError>(())
    }))
    .await;

    assert!(matches!(
        &per_rank[1],
        Err(MrError::Callback { phase: Phase::Map, .. })
    ));
    for rank in [0, 2] {
        assert!(
            matches!(&per_rank[rank], Err(MrError::Aborted(reason)) if reason.contains("cannot sample task 4")),
            "rank {rank}: {:?}",
            per_rank[rank]
        );
    }
}

#[tokio::test]
async fn stages_out_of_order_are_rejected() {
    let mut mr = MapReduce::new(Arc::new(LocalGroup::singleton()), engine());
    let err = mr.reduce(|_, _, _| Ok(())).await.unwrap_err();
    assert!(matches!(err, MrError::InvalidState { op: "reduce", .. }));
    let err = mr.scan_kv(|_, _| Ok(())).await.unwrap_err();
    assert!(matches!(err, MrError::InvalidState { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_reduce_publishes_nothing() {
    let mut mr = MapReduce::new(Arc::new(LocalGroup::singleton()), engine());
    mr.map(3, |id, kv| {
        kv.add(&id.to_le_bytes(), b"")?;
        Ok(())
    })
    .await
    .unwrap();
    mr.collate().await.unwrap();
    let err = mr
        .reduce(|key, _, out| {
            out.add(key, b"partial")?;
            anyhow::ensure!(key != &2u64.to_le_bytes()[..], "bad group");
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MrError::Callback { phase: Phase::Reduce, .. }));
    assert!(mr.kv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grpc_ranks_run_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("master.sock");
    let (shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel::<()>();
    let server = MasterServer::new(Hub::new(2), async move {
        shutdown_receiver.await.unwrap_or(())
    });
    let listener = tokio::net::UnixListener::bind(&sock).unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let per_rank = join_all((0..2).map(|rank| {
        let config = GroupConfig {
            rank,
            size: 2,
            master_sock: sock.clone(),
        };
        async move {
            let comm = WorkerComm::connect(&config).await.unwrap();
            run_pi(Arc::new(comm), 6, 500).await.unwrap()
        }
    }))
    .await;

    assert!(server.hub().all_left().await);
    let _ = shutdown_sender.send(());
    serving.await.unwrap().unwrap();

    let pairs: Pairs = per_rank.into_iter().flatten().collect();
    assert_eq!(pairs.len(), 1);
    let expected = sequential::run(&Pi::new(500), 6).unwrap();
    assert_eq!(pairs[0].1, expected.iter().next().unwrap().1);
}

fn sh(script: &str) -> (std::ffi::OsString, Vec<std::ffi::OsString>) {
    ("sh".into(), vec!["-c".into(), script.into()])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn launcher_passes_group_env() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("master.sock");
    let master = Master::new(3, Some(sock.clone()));
    let (program, args) =
        sh(r#"[ "$MRPI_SIZE" = 3 ] && [ "$MRPI_RANK" -lt 3 ] && [ -S "$MRPI_MASTER_SOCK" ]"#);
    master.run(program, args).await.unwrap();
    assert!(!sock.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_rank_process_fails_the_launch() {
    let dir = tempfile::tempdir().unwrap();
    let master = Master::new(2, Some(dir.path().join("master.sock")));
    let (program, args) = sh(r#"if [ "$MRPI_RANK" = 1 ]; then exit 3; else sleep 30; fi"#);
    let started = Instant::now();
    let err = master.run(program, args).await.unwrap_err();
    // the surviving rank is killed rather than waited out
    assert!(started.elapsed() < Duration::from_secs(10));
    let msg = err.to_string();
    assert!(msg.contains("rank 1 exited with status 3"), "{msg}");
    assert!(msg.contains("rank 0"), "{msg}");
}

#[tokio::test]
async fn launcher_needs_a_rank() {
    let dir = tempfile::tempdir().unwrap();
    let (program, args) = sh("exit 0");
    let err = Master::new(0, Some(dir.path().join("master.sock")))
        .run(program, args)
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<MrError>(), Some(MrError::Usage(_))));
}

#[test]
fn sequential_run_groups_by_key() {
    struct Parity;
    impl MRApp for Parity {
        fn map(&self, task_id: u64, out: &mut KeyValue) -> anyhow::Result<()> {
            out.add(&[(task_id % 2) as u8], &[task_id as u8])?;
            Ok(())
        }
        fn reduce(&self, key: &[u8], values: crate::mr::MultiValue<'_>, out: &mut KeyValue) -> anyhow::Result<()> {
            out.add(key, values.blob())?;
            Ok(())
        }
    }
    let out = sequential::run(&Parity, 6).unwrap();
    let pairs: Vec<_> = out.iter().collect();
    assert_eq!(pairs, vec![(&[0u8][..], &[0u8, 2, 4][..]), (&[1u8][..], &[1u8, 3, 5][..])]);
}
