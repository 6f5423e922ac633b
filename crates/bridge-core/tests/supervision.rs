use bridge_core::virtual_backend::{GraphCall, VirtualGraphEngine, VirtualRegistry};
use bridge_core::{
    evaluate, Action, AudioCaps, BridgeContext, CapabilityFlags, DeviceDescriptor, DeviceId,
    Direction, PipelineManager, PropertyValue, RawNotification, ShutdownToken, TopologyConfig,
    Worker, DEVICE_CAPS,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const A2DP_PCM: &str = "/org/bluealsa/hci0/dev_00_11_22_33_44_55/a2dpsnk/source";
const SCO_PCM: &str = "/org/bluealsa/hci0/dev_00_11_22_33_44_55/hfpag/source";

type Context = BridgeContext<VirtualRegistry, VirtualGraphEngine>;

fn context() -> Context {
    BridgeContext::new(
        PipelineManager::new(
            VirtualRegistry::default(),
            VirtualGraphEngine::default(),
            TopologyConfig::default(),
        ),
        ShutdownToken::new(),
    )
}

fn all_flag_combinations() -> impl Iterator<Item = CapabilityFlags> {
    (0u8..16).map(CapabilityFlags::from_bits_truncate)
}

#[test]
fn no_mode_always_stops_and_releases_everything() {
    for profile in all_flag_combinations().filter(|flags| !flags.has_mode()) {
        let mut pipelines = PipelineManager::new(
            VirtualRegistry::default(),
            VirtualGraphEngine::default(),
            TopologyConfig::default(),
        );
        let mut worker = Worker::new(
            DeviceDescriptor::new(SCO_PCM)
                .with_flags(CapabilityFlags::MODE_MASK | CapabilityFlags::PROFILE_SCO)
                .with_codec("mSBC")
                .with_stream(1, 16_000),
        );
        pipelines.supervise(&mut worker);
        assert!(worker.has_pipelines());

        let mut stripped = Worker::new(worker.descriptor().clone().with_flags(profile));
        assert_eq!(evaluate(&stripped), Action::Stop);
        pipelines.apply(&mut stripped, Action::Stop);
        assert!(stripped.is_idle());

        pipelines.apply(&mut worker, Action::Stop);
        assert!(worker.is_idle());
        assert_eq!(pipelines.engine().live_pipelines(), 0);
    }
}

#[test]
fn sco_without_codec_never_opens_a_channel() {
    let mut ctx = context();
    for flags in all_flag_combinations()
        .filter(|flags| flags.contains(CapabilityFlags::PROFILE_SCO))
    {
        ctx.handle_raw(&RawNotification::pcm_added(
            SCO_PCM,
            json!({ "Transport": "HFP-AG", "Channels": 1, "Sampling": 8000 }),
        ));
        let changes = bridge_core::PropertyChanges {
            mode: Some(flags & CapabilityFlags::MODE_MASK),
            ..Default::default()
        };
        ctx.workers
            .update(&DeviceId::new(SCO_PCM), &changes, &mut ctx.pipelines);
    }
    assert!(ctx.pipelines.registry_service().open_calls().is_empty());
    assert_eq!(ctx.pipelines.engine().builds(), 0);
}

#[test]
fn repeated_evaluation_issues_no_duplicate_calls() {
    let mut ctx = context();
    let added = RawNotification::pcm_added(
        A2DP_PCM,
        json!({ "Mode": "sink", "Transport": "A2DP-sink", "Channels": 2, "Sampling": 44100 }),
    );
    ctx.handle_raw(&added);
    ctx.handle_raw(&added);
    ctx.handle_raw(&RawNotification::properties_changed(
        A2DP_PCM,
        json!({ "Codec": "SBC" }),
    ));
    assert_eq!(ctx.pipelines.engine().builds(), 1);
    assert_eq!(ctx.pipelines.registry_service().open_calls().len(), 1);
}

#[test]
fn teardown_from_any_state_ends_idle() {
    let mut pipelines = PipelineManager::new(
        VirtualRegistry::default(),
        VirtualGraphEngine::default(),
        TopologyConfig::default(),
    );
    for flags in all_flag_combinations() {
        let mut worker = Worker::new(
            DeviceDescriptor::new(SCO_PCM)
                .with_flags(flags)
                .with_codec("CVSD")
                .with_stream(1, 8_000),
        );
        pipelines.supervise(&mut worker);
        pipelines.teardown(&mut worker);
        assert!(worker.is_idle(), "flags {flags:?}");
        pipelines.teardown(&mut worker);
        assert!(worker.is_idle(), "flags {flags:?}");
    }
    assert_eq!(pipelines.engine().live_pipelines(), 0);
}

#[test]
fn a2dp_sink_builds_one_playback_pipeline_with_device_caps() {
    let mut ctx = context();
    ctx.handle_raw(&RawNotification::pcm_added(
        A2DP_PCM,
        json!({ "Mode": "sink", "Transport": "A2DP-sink", "Channels": 2, "Sampling": 44100 }),
    ));

    let worker = ctx.workers.get(&DeviceId::new(A2DP_PCM)).unwrap();
    let pipeline = worker.pipeline(Direction::Sink).unwrap();
    assert!(worker.pipeline(Direction::Source).is_none());
    assert_eq!(ctx.pipelines.engine().builds_for(Direction::Sink), 1);
    assert_eq!(ctx.pipelines.engine().builds_for(Direction::Source), 0);
    assert_eq!(
        ctx.pipelines
            .engine()
            .pipeline(pipeline)
            .unwrap()
            .property(DEVICE_CAPS, "caps"),
        Some(&PropertyValue::Caps(AudioCaps::new(2, 44_100)))
    );
}

#[test]
fn sco_capture_starts_once_codec_is_selected() {
    let mut ctx = context();
    ctx.handle_raw(&RawNotification::pcm_added(
        SCO_PCM,
        json!({ "Mode": "source", "Transport": "HFP-AG", "Codec": "", "Channels": 1, "Sampling": 16000 }),
    ));
    assert_eq!(ctx.pipelines.engine().builds(), 0);
    assert!(ctx.pipelines.registry_service().open_calls().is_empty());

    ctx.handle_raw(&RawNotification::properties_changed(
        SCO_PCM,
        json!({ "Codec": "mSBC" }),
    ));

    let worker = ctx.workers.get(&DeviceId::new(SCO_PCM)).unwrap();
    assert!(worker.pipeline(Direction::Source).is_some());
    assert!(worker.channel().is_some());
    assert_eq!(ctx.pipelines.engine().builds_for(Direction::Source), 1);
    assert_eq!(
        ctx.pipelines.registry_service().open_calls(),
        &[(DeviceId::new(SCO_PCM), Direction::Source)]
    );
}

#[test]
fn wrongly_typed_property_change_leaves_worker_untouched() {
    let mut ctx = context();
    ctx.handle_raw(&RawNotification::pcm_added(
        A2DP_PCM,
        json!({ "Mode": "sink", "Transport": "A2DP-sink", "Channels": 2, "Sampling": 44100 }),
    ));
    let before = ctx
        .workers
        .get(&DeviceId::new(A2DP_PCM))
        .unwrap()
        .descriptor()
        .clone();
    let calls = ctx.pipelines.engine().calls().to_vec();

    ctx.handle_raw(&RawNotification::properties_changed(
        A2DP_PCM,
        json!({ "Mode": "source", "Channels": [1] }),
    ));

    let worker = ctx.workers.get(&DeviceId::new(A2DP_PCM)).unwrap();
    assert_eq!(worker.descriptor(), &before);
    assert_eq!(ctx.pipelines.engine().calls(), calls.as_slice());
}

#[test]
fn removing_unknown_device_changes_nothing() {
    let mut ctx = context();
    ctx.handle_raw(&RawNotification::pcm_added(
        A2DP_PCM,
        json!({ "Mode": "sink", "Transport": "A2DP-sink", "Channels": 2, "Sampling": 44100 }),
    ));
    ctx.handle_raw(&RawNotification::pcm_removed("/org/bluealsa/hci0/dev_66/a2dpsnk/source"));
    assert_eq!(ctx.workers.len(), 1);
    assert_eq!(ctx.pipelines.engine().live_pipelines(), 1);
}

#[test]
fn removal_releases_pipeline_before_forgetting_worker() {
    let mut ctx = context();
    ctx.handle_raw(&RawNotification::pcm_added(
        A2DP_PCM,
        json!({ "Mode": "sink", "Transport": "A2DP-sink", "Channels": 2, "Sampling": 44100 }),
    ));
    ctx.handle_raw(&RawNotification::pcm_removed(A2DP_PCM));
    assert!(ctx.workers.is_empty());
    let calls = ctx.pipelines.engine().calls();
    assert!(matches!(calls.last(), Some(GraphCall::Release(_))));
}

#[test]
fn seeding_starts_enumerated_devices() {
    let registry = VirtualRegistry::with_devices(vec![DeviceDescriptor::new(A2DP_PCM)
        .with_flags(CapabilityFlags::SINK | CapabilityFlags::PROFILE_A2DP)
        .with_stream(2, 48_000)]);
    let mut ctx = BridgeContext::new(
        PipelineManager::new(registry, VirtualGraphEngine::default(), TopologyConfig::default()),
        ShutdownToken::new(),
    );
    assert_eq!(ctx.seed(), 1);
    assert_eq!(ctx.pipelines.engine().live_pipelines(), 1);
}
