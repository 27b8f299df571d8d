//! Plugin fetch, hash verification and load hook tests

mod mock_plugins;

use infergate_core::{sha256_file, EndpointConfig, Error, ServingConfig};
use infergate_engines::{Capabilities, GatewayClient, PluginHost};
use mock_plugins::{MockArtifactStore, MockModel, MockModelStore, MockPlugin, MockPluginLoader};
use std::sync::Arc;

const ARTIFACT: &str = "preprocess.wasm";
const CODE: &[u8] = b"(module $fresh)";

fn gateway() -> GatewayClient {
    GatewayClient::new(&ServingConfig::default()).unwrap()
}

fn endpoint() -> EndpointConfig {
    EndpointConfig::new("custom", "fraud/score")
        .with_version("3")
        .with_preprocess_artifact(ARTIFACT)
}

#[tokio::test]
async fn test_matching_hash_uses_cache() {
    let artifacts = MockArtifactStore::new(ARTIFACT, CODE);
    let loader = MockPluginLoader::new(Arc::new(MockPlugin::wrapping()));
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let loaded = host.load(&endpoint()).await.unwrap().unwrap();
    assert!(loaded.model.is_none());
    assert!(loaded.plugin.capabilities().preprocess);

    assert_eq!(loader.loads(), 1);
    assert_eq!(artifacts.forced_fetches(), 0);
    assert_eq!(models.lookups(), 0);

    let paths = loader.loaded_paths();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), CODE);
}

#[tokio::test]
async fn test_uppercase_recorded_hash_still_matches() {
    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("copy");
    std::fs::write(&copy, CODE).unwrap();
    let upper = sha256_file(&copy).unwrap().to_ascii_uppercase();

    let artifacts = MockArtifactStore::new(ARTIFACT, CODE).with_expected_hash(Some(&upper));
    let loader = MockPluginLoader::new(Arc::new(MockPlugin::wrapping()));
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    host.load(&endpoint()).await.unwrap().unwrap();
    assert_eq!(artifacts.forced_fetches(), 0);
}

#[tokio::test]
async fn test_stale_cache_is_fetched_again_once() {
    let artifacts = MockArtifactStore::new(ARTIFACT, CODE).with_stale_cache(b"(module $stale)");
    let loader = MockPluginLoader::new(Arc::new(MockPlugin::wrapping()));
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    host.load(&endpoint()).await.unwrap().unwrap();

    assert_eq!(artifacts.forced_fetches(), 1);
    assert_eq!(artifacts.fetches(), 2);
    assert_eq!(loader.loads(), 1);

    // the loader saw the fresh copy
    let paths = loader.loaded_paths();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), CODE);
}

#[tokio::test]
async fn test_changed_or_missing_hash_forces_fetch() {
    for expected in [Some("0000"), None] {
        let artifacts = MockArtifactStore::new(ARTIFACT, CODE).with_expected_hash(expected);
        let loader = MockPluginLoader::new(Arc::new(MockPlugin::wrapping()));
        let models = MockModelStore::new("/models/unused");
        let gateway = gateway();
        let host = PluginHost {
            artifacts: &artifacts,
            models: &models,
            loader: &loader,
            gateway: &gateway,
        };

        host.load(&endpoint()).await.unwrap().unwrap();
        assert_eq!(artifacts.forced_fetches(), 1, "expected hash {:?}", expected);
        assert_eq!(loader.loads(), 1);
    }
}

#[tokio::test]
async fn test_no_artifact_loads_nothing() {
    let artifacts = MockArtifactStore::new(ARTIFACT, CODE);
    let loader = MockPluginLoader::failing();
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let loaded = host
        .load(&EndpointConfig::new("custom", "fraud/score"))
        .await
        .unwrap();
    assert!(loaded.is_none());
    assert_eq!(loader.loads(), 0);
    assert_eq!(artifacts.fetches(), 0);
}

#[tokio::test]
async fn test_unknown_artifact_is_config_error() {
    let artifacts = MockArtifactStore::new("other.wasm", CODE);
    let loader = MockPluginLoader::new(Arc::new(MockPlugin::wrapping()));
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let err = host.load(&endpoint()).await.unwrap_err();
    match err {
        Error::Config(msg) => {
            assert!(msg.contains(ARTIFACT));
            assert!(msg.contains("fraud/score/3"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn test_failing_entry_point_is_load_error() {
    let artifacts = MockArtifactStore::new(ARTIFACT, CODE);
    let loader = MockPluginLoader::failing();
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let err = host.load(&endpoint()).await.unwrap_err();
    match &err {
        Error::Load { artifact, .. } => assert_eq!(artifact, ARTIFACT),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), Error::Plugin(_)));
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_load_hook_receives_model_path() {
    let model = Arc::new(MockModel::default());
    let plugin = MockPlugin::new(Capabilities {
        load: true,
        ..Capabilities::none()
    })
    .with_model(model);
    let plugin = Arc::new(plugin);

    let artifacts = MockArtifactStore::new(ARTIFACT, CODE);
    let loader = MockPluginLoader::new(plugin.clone());
    let models = MockModelStore::new("/models/fraud-v3");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let loaded = host
        .load(&endpoint().with_model("fraud-v3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.model.unwrap().describe(), "mock");
    assert_eq!(plugin.load_calls(), 1);
    assert_eq!(models.lookups(), 1);
}

#[tokio::test]
async fn test_load_hook_without_model_id_fails() {
    let plugin = Arc::new(MockPlugin::new(Capabilities {
        load: true,
        ..Capabilities::none()
    }));

    let artifacts = MockArtifactStore::new(ARTIFACT, CODE);
    let loader = MockPluginLoader::new(plugin.clone());
    let models = MockModelStore::new("/models/unused");
    let gateway = gateway();
    let host = PluginHost {
        artifacts: &artifacts,
        models: &models,
        loader: &loader,
        gateway: &gateway,
    };

    let err = host.load(&endpoint()).await.unwrap_err();
    assert!(matches!(err, Error::Load { .. }));
    assert!(matches!(err.root_cause(), Error::Config(_)));
    assert_eq!(plugin.load_calls(), 0);
}
