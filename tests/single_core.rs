//! Federation scenarios on one stand-alone core.

use metronome::{
    core::Time,
    kernel::{
        Core, CoreConfig, FederateTimingConfig, FilterPlacement, IterationRequest,
        IterationState, TranslatorOperator,
    },
};

#[test_log::test(tokio::test)]
async fn value_publication_is_visible_at_grant() {
    let core = Core::new(CoreConfig::standalone("single"));
    let fed = core
        .register_federate(
            "sim1",
            FederateTimingConfig::default().with_time_delta(Time::from_secs(1)),
        )
        .await
        .unwrap();
    let publication = fed.register_publication("sim1_pub", "string", "").await.unwrap();
    let input = fed.register_input("sim1_in").await.unwrap();
    fed.add_subscription(input, "sim1_pub").await.unwrap();

    fed.enter_initializing().await.unwrap();
    assert_eq!(
        fed.enter_executing(IterationRequest::NoIterations).await.unwrap(),
        IterationState::NextStep
    );

    fed.publish(publication, "hello world").await.unwrap();

    let grant = fed
        .request_time(Time::from_secs(50), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs(50));
    assert_eq!(grant.updated_inputs, vec![input]);
    assert_eq!(fed.get_value(input).await.unwrap().as_bytes(), b"hello world");

    // nothing new was published, so the next grant reports no updates
    let grant = fed
        .request_time(Time::from_secs(100), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs(100));
    assert!(grant.updated_inputs.is_empty());
    assert_eq!(fed.get_value(input).await.unwrap().as_bytes(), b"hello world");
}

#[test_log::test(tokio::test)]
async fn binary_payload_with_embedded_nul_is_preserved() {
    let core = Core::new(CoreConfig::standalone("binary"));
    let fed = core
        .register_federate(
            "sim1",
            FederateTimingConfig::default().with_time_delta(Time::from_secs(1)),
        )
        .await
        .unwrap();
    let publication = fed.register_publication("raw", "raw", "").await.unwrap();
    let input = fed.register_input("raw_in").await.unwrap();
    fed.add_subscription(input, "raw").await.unwrap();
    fed.enter_initializing().await.unwrap();
    fed.enter_executing(IterationRequest::NoIterations).await.unwrap();

    let payload: Vec<u8> = vec![1, 2, 3, 0, 5, 6, 7, 8, 9, 10, 11, 12, 13, 0, 15, 16, 17];
    assert_eq!(payload.len(), 17);
    fed.publish(publication, payload.clone()).await.unwrap();

    let grant = fed
        .request_time(Time::from_secs(150), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs(150));
    assert_eq!(fed.get_value(input).await.unwrap().as_bytes(), payload.as_slice());

    let grant = fed
        .request_time(Time::from_secs(200), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs(200));
    assert!(grant.updated_inputs.is_empty());
}

#[test_log::test(tokio::test)]
async fn period_and_offset_snap_grants_to_the_grid() {
    let core = Core::new(CoreConfig::standalone("grid"));
    let config = FederateTimingConfig::default()
        .with_period(Time::from_secs(2), Time::from_secs_f64(0.5));
    let fed = core.register_federate("gridded", config).await.unwrap();
    fed.enter_initializing().await.unwrap();
    fed.enter_executing(IterationRequest::NoIterations).await.unwrap();

    let grant = fed
        .request_time(Time::from_secs_f64(0.5), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs_f64(0.5));

    // 1.2 is off-grid; the next grid point past it is 2.5
    let grant = fed
        .request_time(Time::from_secs_f64(1.2), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(grant.time, Time::from_secs_f64(2.5));
}

#[test_log::test(tokio::test)]
async fn exec_entry_iteration_stops_at_the_limit() {
    let core = Core::new(CoreConfig::standalone("iterate"));
    let config = FederateTimingConfig::default().with_max_iterations(3);
    let fed = core.register_federate("looper", config).await.unwrap();
    let publication = fed.register_publication("loop_pub", "", "").await.unwrap();
    let input = fed.register_input("loop_in").await.unwrap();
    fed.add_subscription(input, "loop_pub").await.unwrap();
    fed.enter_initializing().await.unwrap();

    // a pre-exec publication counts as an init-time update
    fed.publish(publication, "seed").await.unwrap();

    let mut iterations = 0;
    loop {
        match fed.enter_executing(IterationRequest::IterateIfNeeded).await.unwrap() {
            IterationState::Iterating => {
                iterations += 1;
                assert!(iterations <= 3, "must stop iterating at max_iterations");
                // keep the updates coming so only the limit can stop us
                fed.publish(publication, format!("round {iterations}")).await.unwrap();
            }
            IterationState::NextStep => break,
            other => panic!("unexpected exec entry state {other:?}"),
        }
    }
    assert_eq!(iterations, 3);
}

#[test_log::test(tokio::test)]
async fn filters_transform_messages_between_endpoints() {
    let core = Core::new(CoreConfig::standalone("filtered"));
    let fed_a = core
        .register_federate("sender", FederateTimingConfig::default())
        .await
        .unwrap();
    let fed_b = core
        .register_federate("receiver", FederateTimingConfig::default())
        .await
        .unwrap();
    let end1 = fed_a.register_endpoint("end1").await.unwrap();
    let end2 = fed_b.register_endpoint("end2").await.unwrap();
    fed_a.add_endpoint_link("end1", "end2").await.unwrap();

    // both filters bump the first payload byte by one
    let bump = || {
        Box::new(|mut msg: metronome::kernel::EndpointMessage| {
            let mut bytes = msg.payload.release();
            if let Some(first) = bytes.first_mut() {
                *first += 1;
            }
            msg.payload = bytes.into();
            vec![msg]
        }) as metronome::kernel::FilterOperator
    };
    let source_filter =
        fed_a.register_filter("sf", FilterPlacement::Source, "end1").await.unwrap();
    fed_a.set_filter_operator(source_filter, bump()).await.unwrap();
    let dest_filter =
        fed_b.register_filter("df", FilterPlacement::Destination, "end2").await.unwrap();
    fed_b.set_filter_operator(dest_filter, bump()).await.unwrap();

    fed_a.enter_initializing().await.unwrap();
    fed_b.enter_initializing().await.unwrap();
    let (a, b) = tokio::join!(
        fed_a.enter_executing(IterationRequest::NoIterations),
        fed_b.enter_executing(IterationRequest::NoIterations)
    );
    a.unwrap();
    b.unwrap();

    fed_a.send_message(end1, "end2", "hello world").await.unwrap();

    let (grant_a, grant_b) = tokio::join!(
        fed_a.request_time(Time::from_secs(1), IterationRequest::NoIterations),
        fed_b.request_time(Time::from_secs(1), IterationRequest::NoIterations)
    );
    grant_a.unwrap();
    let grant_b = grant_b.unwrap();
    assert!(grant_b.time <= Time::from_secs(1));

    let msg = fed_b.receive_message(end2).await.expect("message must be delivered");
    // two increments: 'h' -> 'j'
    assert_eq!(msg.payload.as_bytes()[0], b'j');
    assert_eq!(&msg.payload.as_bytes()[1..], b"ello world");
}

#[test_log::test(tokio::test)]
async fn translator_converts_messages_to_values() {
    let core = Core::new(CoreConfig::standalone("translated"));
    let fed = core
        .register_federate("xlator", FederateTimingConfig::default())
        .await
        .unwrap();
    let observer = core
        .register_federate("observer", FederateTimingConfig::default())
        .await
        .unwrap();

    let translator =
        fed.register_translator("bridge", TranslatorOperator::Binary).await.unwrap();
    let sender = fed.register_endpoint("raw_src").await.unwrap();
    let input = observer.register_input("watch").await.unwrap();
    // the translator publishes converted messages under its own name
    observer.add_subscription(input, "bridge").await.unwrap();

    fed.enter_initializing().await.unwrap();
    observer.enter_initializing().await.unwrap();
    let (a, b) = tokio::join!(
        fed.enter_executing(IterationRequest::NoIterations),
        observer.enter_executing(IterationRequest::NoIterations)
    );
    a.unwrap();
    b.unwrap();

    fed.send_message(sender, "bridge.msg", &b"raw-bytes"[..]).await.unwrap();
    let _ = translator;

    let (grant_fed, grant_obs) = tokio::join!(
        fed.request_time(Time::from_secs(10), IterationRequest::NoIterations),
        observer.request_time(Time::from_secs(1), IterationRequest::NoIterations)
    );
    grant_fed.unwrap();
    let grant = grant_obs.unwrap();
    assert_eq!(grant.updated_inputs, vec![input]);
    assert_eq!(observer.get_value(input).await.unwrap().as_bytes(), b"raw-bytes");
}

#[test_log::test(tokio::test)]
async fn duplicate_interface_names_are_rejected() {
    let core = Core::new(CoreConfig::standalone("dupes"));
    let fed = core
        .register_federate("solo", FederateTimingConfig::default())
        .await
        .unwrap();

    fed.register_publication("dup_pub", "string", "").await.unwrap();
    assert!(fed.register_publication("dup_pub", "string", "").await.is_err());

    fed.register_input("dup_in").await.unwrap();
    assert!(fed.register_input("dup_in").await.is_err(), "duplicate input must be rejected");

    fed.register_endpoint("dup_end").await.unwrap();
    assert!(fed.register_endpoint("dup_end").await.is_err());

    let inputs = fed.query("solo", "inputs", metronome::kernel::QueryMode::Fast).await;
    let parsed: Vec<String> = serde_json::from_str(&inputs).unwrap();
    assert_eq!(parsed, vec!["dup_in".to_string()]);
}

#[test_log::test(tokio::test)]
async fn queries_report_core_state() {
    let core = Core::new(CoreConfig::standalone("queried"));
    let fed = core
        .register_federate("alpha", FederateTimingConfig::default())
        .await
        .unwrap();
    let _ = core.register_federate("beta", FederateTimingConfig::default()).await.unwrap();

    let name = core.query("core", "name", metronome::kernel::QueryMode::Fast).await;
    assert_eq!(name, "\"queried\"");

    let feds = core.query("core", "federates", metronome::kernel::QueryMode::Fast).await;
    let parsed: Vec<String> = serde_json::from_str(&feds).unwrap();
    assert_eq!(parsed.len(), 2);
    assert!(parsed.contains(&"alpha".to_string()));

    let state = fed.query("alpha", "state", metronome::kernel::QueryMode::Fast).await;
    assert_eq!(state, "\"Created\"");

    let unknown = core.query("core", "nonsense", metronome::kernel::QueryMode::Fast).await;
    let parsed: serde_json::Value = serde_json::from_str(&unknown).unwrap();
    assert_eq!(parsed["error"]["code"], 400);

    let missing = core.query("nowhere", "name", metronome::kernel::QueryMode::Fast).await;
    let parsed: serde_json::Value = serde_json::from_str(&missing).unwrap();
    assert_eq!(parsed["error"]["code"], 404);
}
