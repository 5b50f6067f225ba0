mod common;

use std::time::Duration;

use common::{config, fast_retry, payload, Cluster, KIB};
use megaswarm::directory::DirectoryExt;

#[tokio::test(start_paused = true)]
async fn test_departed_host_is_evicted_and_chunks_healed() {
    let cluster = Cluster::with_peers(4, |name| config(name, 4 * KIB));
    let origin = cluster.origin();
    let data = payload(12 * KIB as usize);
    let result = origin.manager.submit_file(data.clone(), "heal.bin").await.unwrap();
    assert!(result.success);

    let departed = result.chunks[0].hosts[0];
    let affected = result
        .chunks
        .iter()
        .filter(|c| c.hosts.contains(&departed))
        .count();
    cluster.node(&departed).faults.set_offline(true);

    tokio::time::advance(origin.manager.config().peer_timeout + Duration::from_secs(1)).await;
    let report = origin.manager.run_maintenance().await.unwrap();

    assert_eq!(report.peers_contacted, 4);
    assert_eq!(report.peers_responded, 3);
    assert_eq!(report.evicted, vec![departed]);
    assert_eq!(report.chunks_checked, 3);
    assert_eq!(report.under_replicated, affected);
    assert_eq!(report.healed, affected);
    assert_eq!(report.unhealed, 0);
    assert_eq!(report.stats.peer_count, 3);

    for chunk in &result.chunks {
        let record = origin
            .manager
            .directory()
            .lookup_chunk(&chunk.chunk_id, &fast_retry())
            .await
            .unwrap();
        assert_eq!(record.hosts.len(), 2);
        assert!(!record.hosts.contains(&departed));
        for host in &record.hosts {
            assert!(cluster.node(host).manager.service().store().contains(&chunk.chunk_id));
        }
    }

    let status = origin.manager.hosting_status().await;
    assert_eq!(status.len(), 1);
    assert!(status[0].is_fully_available());

    let back = origin.manager.retrieve_file(&result.file_id).await.unwrap();
    assert_eq!(back, data);
}

#[tokio::test(start_paused = true)]
async fn test_healthy_swarm_needs_no_healing() {
    let cluster = Cluster::with_peers(3, |name| config(name, 4 * KIB));
    let origin = cluster.origin();
    origin
        .manager
        .submit_file(payload(8 * KIB as usize), "steady.bin")
        .await
        .unwrap();

    let report = origin.manager.run_maintenance().await.unwrap();
    assert_eq!(report.peers_responded, 3);
    assert!(report.evicted.is_empty());
    assert_eq!(report.chunks_checked, 2);
    assert_eq!(report.under_replicated, 0);
    assert_eq!(report.healed, 0);
    assert_eq!(report.stats.hosted_file_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_live_peers() {
    let cluster = Cluster::with_peers(2, |name| config(name, 4 * KIB));
    let origin = cluster.origin();
    let timeout = origin.manager.config().peer_timeout;

    // Each cycle refreshes the peers before the timeout runs out.
    for _ in 0..5 {
        tokio::time::advance(timeout / 2).await;
        let report = origin.manager.run_maintenance().await.unwrap();
        assert!(report.evicted.is_empty());
    }
    assert_eq!(origin.manager.peers().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_runs_on_schedule_until_stopped() {
    let cluster = Cluster::with_peers(2, |name| config(name, 4 * KIB));
    let origin = cluster.origin();
    let interval = origin.manager.config().maintenance_interval;

    let handle = origin.manager.start_maintenance();
    assert!(handle.is_running());
    assert_eq!(handle.cycles(), 0);

    tokio::time::sleep(interval * 3 + interval / 2).await;
    assert_eq!(handle.cycles(), 3);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_maintenance_evicts_silent_peer() {
    let cluster = Cluster::with_peers(3, |name| config(name, 4 * KIB));
    let origin = cluster.origin();
    let silent = cluster.nodes[2].id;
    cluster.nodes[2].faults.set_offline(true);

    let handle = origin.manager.start_maintenance();
    let settings = origin.manager.config();
    tokio::time::sleep(settings.peer_timeout + settings.maintenance_interval * 2).await;
    handle.stop().await;

    let known: Vec<_> = origin.manager.peers().iter().map(|p| p.id).collect();
    assert_eq!(known.len(), 2);
    assert!(!known.contains(&silent));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_node_learns_joiner_from_heartbeat() {
    let mut cluster = Cluster::new();
    let boot = cluster.add(config("boot", 4 * KIB));
    let joiner = cluster.add(config("joiner", 4 * KIB));
    let (boot, joiner) = (&cluster.nodes[boot], &cluster.nodes[joiner]);

    // Only the joiner is told about the other side.
    joiner.manager.add_peer(boot.manager.descriptor());
    assert!(boot.manager.peers().is_empty());

    let report = joiner.manager.run_maintenance().await.unwrap();
    assert_eq!(report.peers_responded, 1);
    let known: Vec<_> = boot.manager.peers().iter().map(|p| p.id).collect();
    assert_eq!(known, vec![joiner.id]);

    let report = boot.manager.run_maintenance().await.unwrap();
    assert_eq!(report.peers_contacted, 1);
    assert_eq!(report.peers_responded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_joiners_discover_each_other_through_bootstrap() {
    let mut cluster = Cluster::new();
    for name in ["boot", "joiner-a", "joiner-b"] {
        cluster.add(config(name, 4 * KIB));
    }
    let boot = cluster.nodes[0].manager.descriptor();
    for node in &cluster.nodes[1..] {
        node.manager.add_peer(boot.clone());
    }

    cluster.nodes[1].manager.run_maintenance().await.unwrap();
    let report = cluster.nodes[2].manager.run_maintenance().await.unwrap();
    assert_eq!(report.discovered, vec![cluster.nodes[1].id]);

    for node in &cluster.nodes {
        let known: Vec<_> = node.manager.peers().iter().map(|p| p.id).collect();
        assert_eq!(known.len(), 2, "{} knows {:?}", node.id, known);
        assert!(!known.contains(&node.id));
    }

    let report = cluster.origin().manager.run_maintenance().await.unwrap();
    assert_eq!(report.peers_responded, 2);
    assert!(report.discovered.is_empty());

    // The bootstrap node can now place its own chunks.
    let result = cluster
        .origin()
        .manager
        .submit_file(payload(8 * KIB as usize), "from-boot.bin")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.total_hosts, 4);
}
