//! Session lifecycle against the in-memory engine.
//!
//! Every scenario provisions through a real `Session` and checks what the
//! engine saw: which calls were made, in which order, and what is left
//! after teardown.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use container_fixtures::FixtureError;
use container_fixtures::config::Settings;
use container_fixtures::config::matrix::container_matrix;
use container_fixtures::provision::{NetworkDriver, ResourceKind, VolumeKind, VolumeRequest};
use container_fixtures::session::{
    ContainerRequest, NetworkRequest, Resource, ResourceSpec, Scope, ServiceRequest, Session,
    SessionContext,
};
use container_fixtures::testing::FakeEngine;

fn fast_settings() -> Settings {
    Settings {
        network_settle: Duration::ZERO,
        default_start_period: Duration::ZERO,
        ..Default::default()
    }
}

fn engine() -> Arc<FakeEngine> {
    Arc::new(FakeEngine::new().with_image(FakeEngine::python_hello()))
}

fn session(engine: &Arc<FakeEngine>) -> Session {
    let context = SessionContext::new(fast_settings()).unwrap();
    Session::new(Scope::Class, engine.clone(), context).with_test_name("test_lifecycle")
}

/// Position of the first recorded call starting with `prefix`.
fn position(calls: &[String], prefix: &str) -> usize {
    calls
        .iter()
        .position(|c| c.starts_with(prefix))
        .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:?}"))
}

// ── Round trips ────────────────────────────────────────────────────────────

#[tokio::test]
async fn every_matrix_case_is_fully_removed() {
    for case in container_matrix() {
        let engine = engine();
        let mut session = session(&engine);
        let image = session.image().await.unwrap();

        let request = ContainerRequest::new(image)
            .network(case.network)
            .volumes(case.volume)
            .env("FOO", "2018");
        let fixture = session.provision_container(&request).await.unwrap();
        assert_eq!(
            fixture.container.status.as_deref(),
            Some("running"),
            "{}",
            case.param_id()
        );

        let report = session.teardown_all().await;
        assert!(report.is_clean(), "{}: {:?}", case.param_id(), report.failures);
        assert_eq!(engine.container_count(), 0, "{}", case.param_id());
        assert_eq!(engine.volume_count(), 0, "{}", case.param_id());
        assert_eq!(engine.network_count(), 0, "{}", case.param_id());
        assert!(!engine.has_container(&fixture.container.id));
    }
}

#[tokio::test]
async fn service_round_trip_leaves_nothing_behind() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();

    let fixture = session
        .service(&ServiceRequest::new(image).env("HELLO", "world"))
        .await
        .unwrap();
    assert!(fixture.swarm.is_owned());
    assert!(engine.has_service(&fixture.service.id));

    session.teardown_all().await.into_result().unwrap();
    assert!(!engine.has_service(&fixture.service.id));
    assert!(!engine.has_network(fixture.network.id()));

    let calls = engine.calls();
    assert!(position(&calls, "remove_service") < position(&calls, "remove_network"));
    assert!(position(&calls, "remove_network") < position(&calls, "leave_swarm"));
}

#[tokio::test]
async fn create_dispatches_over_every_spec() {
    let engine = engine();
    let mut session = session(&engine);

    let network = session
        .create(ResourceSpec::Network(NetworkDriver::Bridge.into()))
        .await
        .unwrap();
    assert!(matches!(network, Resource::Network(ref n) if n.attachable));

    let volumes = session
        .create(ResourceSpec::Volume(VolumeKind::Named.into()))
        .await
        .unwrap();
    match volumes {
        Resource::Volumes(set) => assert_eq!(set.handles.len(), 1),
        other => panic!("unexpected resource: {other:?}"),
    }

    assert_eq!(session.registry().len(), 2);
    session.teardown_all().await.into_result().unwrap();
    assert_eq!(engine.network_count(), 0);
    assert_eq!(engine.volume_count(), 0);
}

#[tokio::test]
async fn supplied_names_are_used_and_empty_ones_generated() {
    let engine = engine();
    let mut session = session(&engine);

    let named = session
        .create(ResourceSpec::Network(
            NetworkRequest::new(NetworkDriver::Bridge).name("backend"),
        ))
        .await
        .unwrap();
    let generated = session
        .create(ResourceSpec::Network(NetworkRequest::new(NetworkDriver::Bridge).name("")))
        .await
        .unwrap();
    match (named, generated) {
        (Resource::Network(named), Resource::Network(generated)) => {
            assert_eq!(named.name(), "backend");
            assert!(generated.name().starts_with("pytest_python-hello_"));
        }
        other => panic!("unexpected resources: {other:?}"),
    }

    let volumes = session
        .create(ResourceSpec::Volume(
            VolumeRequest::new(VolumeKind::Named).name("store").target("/cache"),
        ))
        .await
        .unwrap();
    match volumes {
        Resource::Volumes(set) => {
            let names: Vec<&str> = set.handles.iter().map(|h| h.name.as_str()).collect();
            assert_eq!(names, vec!["store_data", "store_cache"]);
            let targets: Vec<&str> = set.bindings.iter().map(|b| b.target.as_str()).collect();
            assert_eq!(targets, vec!["/data", "/cache"]);
        }
        other => panic!("unexpected resource: {other:?}"),
    }

    let image = session.image().await.unwrap();
    let container = session
        .create(ResourceSpec::Container(
            ContainerRequest::new(image.clone()).name("hello"),
        ))
        .await
        .unwrap();
    match container {
        Resource::Container(fixture) => assert_eq!(fixture.container.name, "hello"),
        other => panic!("unexpected resource: {other:?}"),
    }
    let unnamed = session
        .provision_container(&ContainerRequest::new(image.clone()))
        .await
        .unwrap();
    assert!(unnamed.container.name.starts_with("pytest_python-hello_"));

    let service = session
        .service(&ServiceRequest::new(image).name("web"))
        .await
        .unwrap();
    assert_eq!(service.service.name, "web");

    session.teardown_all().await.into_result().unwrap();
    assert_eq!(engine.network_count(), 0);
    assert_eq!(engine.volume_count(), 0);
    assert_eq!(engine.container_count(), 0);
}

// ── Idempotence ────────────────────────────────────────────────────────────

#[tokio::test]
async fn teardown_twice_is_safe() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    session
        .provision_container(
            &ContainerRequest::new(image)
                .network(NetworkDriver::Bridge)
                .volumes(VolumeKind::Named),
        )
        .await
        .unwrap();

    let first = session.teardown_all().await.into_result().unwrap();
    assert_eq!(first.removed.len(), 3);
    let removals = engine.calls().len();

    let second = session.teardown_all().await.into_result().unwrap();
    assert!(second.removed.is_empty());
    assert!(second.failures.is_empty());
    assert_eq!(engine.calls().len(), removals);
}

#[tokio::test]
async fn resources_removed_out_of_band_count_as_gone() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(&ContainerRequest::new(image).volumes(VolumeKind::Named))
        .await
        .unwrap();

    engine.forget_container(&fixture.container.id);
    let report = session.teardown_all().await.into_result().unwrap();

    assert_eq!(report.already_gone.len(), 1);
    assert_eq!(report.already_gone[0].kind, ResourceKind::Container);
    assert!(engine.calls_starting_with("remove_container").is_empty());
    assert_eq!(engine.volume_count(), 0);
}

// ── Built-in networks ──────────────────────────────────────────────────────

#[tokio::test]
async fn builtin_networks_are_never_created_or_removed() {
    for driver in [NetworkDriver::Host, NetworkDriver::Default] {
        let engine = engine();
        let mut session = session(&engine);

        let network = session.network(driver).await.unwrap();
        assert!(network.is_builtin());

        let report = session.teardown_all().await.into_result().unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(engine.calls_starting_with("create_network").is_empty());
        assert!(engine.calls_starting_with("remove_network").is_empty());
        assert!(engine.has_network(network.id()));
    }
}

// ── Ordering ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn named_volume_outlives_its_container() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(&ContainerRequest::new(image).volumes(VolumeKind::Named))
        .await
        .unwrap();

    assert_eq!(fixture.volumes.handles.len(), 1);
    let volume = &fixture.volumes.handles[0];
    assert_eq!(fixture.volumes.bindings[0].target, "/data");

    session.teardown_all().await.into_result().unwrap();

    let calls = engine.calls();
    assert_eq!(engine.calls_starting_with("create_volume").len(), 1);
    assert!(position(&calls, "create_volume") < position(&calls, "run_container"));
    assert!(position(&calls, "remove_container") < position(&calls, "remove_volume"));
    assert!(!engine.has_volume(&volume.id));
}

#[tokio::test]
async fn data_container_is_removed_after_its_consumer() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(&ContainerRequest::new(image).volumes(VolumeKind::Container))
        .await
        .unwrap();

    let data = fixture.volumes.data_container.clone().unwrap();
    let created = engine.created_container(&fixture.container.id).unwrap();
    assert_eq!(created.volumes_from, vec![data.id.clone()]);

    session.teardown_all().await.into_result().unwrap();
    let removals = engine.calls_starting_with("remove_container");
    assert_eq!(
        removals,
        vec![
            format!("remove_container {}", fixture.container.id),
            format!("remove_container {}", data.id),
        ]
    );
}

#[tokio::test]
async fn client_on_default_bridge_uses_a_link() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(&ContainerRequest::new(image))
        .await
        .unwrap();

    let client = session
        .client_container(&fixture.container, None)
        .await
        .unwrap();
    let created = engine.created_container(&client.id).unwrap();
    assert_eq!(
        created.links,
        vec![format!("{0}:{0}", fixture.container.name)]
    );
    assert!(created.extra_hosts.is_empty());
    assert_eq!(created.network_mode, None);

    session.teardown_all().await.into_result().unwrap();
    let removals = engine.calls_starting_with("remove_container");
    assert_eq!(removals[0], format!("remove_container {}", client.id));
}

#[tokio::test]
async fn client_on_host_network_maps_loopback() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(&ContainerRequest::new(image).network(NetworkDriver::Host))
        .await
        .unwrap();

    let client = session
        .client_container(&fixture.container, None)
        .await
        .unwrap();
    let created = engine.created_container(&client.id).unwrap();
    assert_eq!(
        created.extra_hosts,
        vec![format!("{}:127.0.0.1", fixture.container.name)]
    );
    assert!(created.links.is_empty());

    session.teardown_all().await.into_result().unwrap();
}

// ── Failures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_failed_removal_does_not_stop_the_rest() {
    let engine = engine();
    let mut session = session(&engine);
    let image = session.image().await.unwrap();
    let fixture = session
        .provision_container(
            &ContainerRequest::new(image)
                .network(NetworkDriver::Bridge)
                .volumes(VolumeKind::Named),
        )
        .await
        .unwrap();
    let volume = fixture.volumes.handles[0].clone();
    engine.fail_removal_of(&volume.id);

    let report = session.teardown_all().await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.removed.len(), 2);
    assert!(!engine.has_container(&fixture.container.id));
    assert!(!engine.has_network(fixture.network.id()));
    assert!(engine.has_volume(&volume.id));
    assert_eq!(session.registry().owned_live_count(), 1);

    match report.into_result().unwrap_err() {
        FixtureError::Teardown { kind, id, .. } => {
            assert_eq!(kind, ResourceKind::Volume);
            assert_eq!(id, volume.id);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failed_setup_still_tears_down_earlier_resources() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_image(FakeEngine::python_hello())
            .failing("run_container", 0),
    );
    let session = session(&engine);

    let err = session
        .scoped(async |s| {
            let image = s.image().await?;
            let request = ContainerRequest::new(image)
                .network(NetworkDriver::Bridge)
                .volumes(VolumeKind::Named);
            s.provision_container(&request).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FixtureError::Provision {
            kind: ResourceKind::Container,
            ..
        }
    ));
    assert_eq!(engine.network_count(), 0);
    assert_eq!(engine.volume_count(), 0);
}

#[tokio::test]
async fn scoped_returns_the_closure_value() {
    let engine = engine();
    let session = session(&engine);

    let name = session
        .scoped(async |s| {
            let image = s.image().await?;
            let fixture = s
                .provision_container(&ContainerRequest::new(image).network(NetworkDriver::Overlay))
                .await?;
            Ok(fixture.container.name)
        })
        .await
        .unwrap();

    assert!(name.starts_with("pytest_python-hello_"));
    assert_eq!(engine.container_count(), 0);
    assert_eq!(engine.network_count(), 0);
    assert_eq!(engine.calls_starting_with("leave_swarm").len(), 1);
}

// ── Swarm ownership ────────────────────────────────────────────────────────

#[tokio::test]
async fn preexisting_swarm_survives_teardown() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_image(FakeEngine::python_hello())
            .with_swarm(),
    );
    let mut session = session(&engine);

    let network = session.network(NetworkDriver::Overlay).await.unwrap();
    let swarm = session.swarm().await.unwrap();
    assert!(!swarm.is_owned());

    session.teardown_all().await.into_result().unwrap();
    assert!(!engine.has_network(network.id()));
    assert!(engine.calls_starting_with("leave_swarm").is_empty());
}

// ── Grace periods ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn default_settle_and_start_periods_are_waited() {
    let engine = engine();
    let context = SessionContext::new(Settings::default()).unwrap();
    let mut session = Session::new(Scope::Module, engine.clone(), context);
    let image = session.image().await.unwrap();

    let started = tokio::time::Instant::now();
    session
        .provision_container(&ContainerRequest::new(image).network(NetworkDriver::Bridge))
        .await
        .unwrap();

    // 5 s network settle + 1 s default start period.
    assert!(started.elapsed() >= Duration::from_secs(6));
    session.teardown_all().await.into_result().unwrap();
}

// ── Drop fallback ──────────────────────────────────────────────────────────

#[tokio::test]
async fn dropped_session_cleans_up_in_background() {
    let engine = engine();
    {
        let mut session = session(&engine);
        let image = session.image().await.unwrap();
        session.data_container(&image).await.unwrap();
        assert_eq!(engine.container_count(), 1);
    }

    for _ in 0..100 {
        if engine.container_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(engine.container_count(), 0);
}
