//! End-to-end behaviour of the precise-timing core.

use oldies_core::{PreciseTime, Step, TimeGrid};
use oldies_nest::{
    CrossingStrategy, DelayRegistry, EventKind, IafPscExpParams, IafPscExpPs, KernelParams, NestError, Network,
    NetworkConfig, NodeSpec, Propagatable, SliceRingBuffer, SpikeData, SpikeGeneratorParams, SpikingModel,
    StdpParams, SynapseModel, ThresholdTestable,
};

fn kernel(resolution: f64, num_threads: usize) -> KernelParams {
    KernelParams {
        resolution,
        num_threads,
        ..Default::default()
    }
}

#[test]
fn test_continuous_delay_delivery_order() {
    let grid = TimeGrid::new(1.0).unwrap();
    let mut registry = DelayRegistry::new(grid);
    let delay = registry.decompose(1.7).unwrap();
    registry.lock();

    // A fires at 2.0 and 5.5 ms
    let arrivals: Vec<(Step, PreciseTime)> = [2.0, 5.5]
        .iter()
        .map(|&t| {
            let spike = grid.precise(t).unwrap();
            (spike.step, delay.apply(spike, 1.0))
        })
        .collect();

    let mut queue = SliceRingBuffer::new(registry.min_delay_steps(), registry.max_delay_steps());
    let mut log = Vec::new();
    for origin in 0..9 {
        queue.set_origin(origin);
        // spikes emitted in the previous one-step slice
        for &(emitted, arrival) in &arrivals {
            if emitted == origin {
                queue.add_spike(arrival.step - 1 - origin, arrival.step, arrival.offset, 1.0);
            }
        }
        if origin == 6 {
            queue.add_refractory(8, 0.0);
        }
        queue.prepare_delivery();
        let stamp = origin + 1;
        while let Some(delivery) = queue.get_next(stamp, false) {
            log.push((stamp, delivery));
        }
    }

    assert_eq!(log.len(), 3);
    assert_eq!(log[0].0, 4);
    assert!((log[0].1.offset - 0.3).abs() < 1e-12);
    assert_eq!(log[0].1.kind, EventKind::Spike);
    assert_eq!(log[1].0, 8);
    assert!((log[1].1.offset - 0.8).abs() < 1e-12);
    assert_eq!(log[1].1.kind, EventKind::Spike);
    assert_eq!(log[2].0, 8);
    assert_eq!(log[2].1.offset, 0.0);
    assert_eq!(log[2].1.kind, EventKind::RefractoryReturn);
    assert!(queue.is_empty());
}

#[test]
fn test_network_delivers_at_exact_continuous_delay() {
    let mut net = Network::new(kernel(1.0, 1)).unwrap();
    let a = net
        .add_spike_generator(&SpikeGeneratorParams {
            spike_times: vec![2.0, 5.5],
            spike_weights: vec![],
        })
        .unwrap();
    let b = net
        .create(&NodeSpec::IafPscExpPs {
            params: IafPscExpParams::default(),
            crossing: CrossingStrategy::Bisection,
            count: 1,
        })
        .unwrap()
        .ids[0];
    net.connect(a, b, 100.0, 1.7, &SynapseModel::Static).unwrap();
    net.record_membrane(b).unwrap();
    net.simulate(10.0).unwrap();

    // inputs arrive at 3.7 and 7.2 ms
    let model = IafPscExpPs::new(IafPscExpParams::default());
    let mut s = model.initial_state();
    model.apply_input(&mut s, 100.0);
    let v4 = model.membrane(&model.propagate(&s, 0.3));
    let mut s = model.propagate(&s, 3.5);
    model.apply_input(&mut s, 100.0);
    let v9 = model.membrane(&model.propagate(&s, 1.8));

    let trace = net.membrane_trace(b).unwrap().unwrap();
    assert_eq!(trace.len(), 10);
    assert!((trace.values[2] + 70.0).abs() < 1e-12);
    assert!((trace.values[3] - v4).abs() < 1e-9);
    assert!((trace.values[8] - v9).abs() < 1e-9);
    assert_eq!(net.spike_data().n_events(), 2);
}

fn recurrent_run(num_threads: usize) -> SpikeData {
    let mut net = Network::new(kernel(0.1, num_threads)).unwrap();
    let gen = net
        .add_spike_generator(&SpikeGeneratorParams {
            spike_times: (1..40).map(|i| i as f64 * 2.37).collect(),
            spike_weights: vec![],
        })
        .unwrap();
    let pop = net
        .create(&NodeSpec::IafPscExpPs {
            params: IafPscExpParams {
                i_e: 380.0,
                ..Default::default()
            },
            crossing: CrossingStrategy::StateSpace,
            count: 12,
        })
        .unwrap();

    for (k, &target) in pop.ids.iter().enumerate() {
        net.connect(gen, target, 300.0, 1.0 + 0.13 * k as f64, &SynapseModel::Static)
            .unwrap();
    }
    for (i, &source) in pop.ids.iter().enumerate() {
        for (j, &target) in pop.ids.iter().enumerate() {
            if i != j && (i + 2 * j) % 5 == 0 {
                let weight = if i % 3 == 0 { -400.0 } else { 250.0 };
                net.connect(source, target, weight, 0.8 + 0.07 * (i + j) as f64, &SynapseModel::Static)
                    .unwrap();
            }
        }
    }
    net.simulate(150.0).unwrap();
    net.spike_data().clone()
}

#[test]
fn test_results_do_not_depend_on_thread_count() {
    let single = recurrent_run(1);
    let parallel = recurrent_run(4);
    // the generator alone contributes 39 spikes
    assert!(single.n_events() > 39);
    assert_eq!(single.senders, parallel.senders);
    assert_eq!(single.times, parallel.times);
}

#[test]
fn test_bad_delay_after_lock() {
    let mut net = Network::new(kernel(0.1, 1)).unwrap();
    let pop = net
        .create(&NodeSpec::IafPscExpPs {
            params: IafPscExpParams::default(),
            crossing: CrossingStrategy::default(),
            count: 2,
        })
        .unwrap();
    let (a, b) = (pop.ids[0], pop.ids[1]);

    assert!(matches!(
        net.connect(a, b, 1.0, 0.05, &SynapseModel::Static),
        Err(NestError::BadDelay(_))
    ));
    net.connect(a, b, 1.0, 1.0, &SynapseModel::Static).unwrap();
    net.connect(b, a, 1.0, 2.0, &SynapseModel::Static).unwrap();
    net.simulate(1.0).unwrap();
    assert!(net.delays().is_locked());

    assert!(matches!(
        net.connect(a, b, 1.0, 0.5, &SynapseModel::Static),
        Err(NestError::BadDelay(_))
    ));
    assert!(matches!(
        net.connect(a, b, 1.0, 5.0, &SynapseModel::Static),
        Err(NestError::BadDelay(_))
    ));
    net.connect(a, b, 1.0, 1.55, &SynapseModel::Static).unwrap();
    assert_eq!(net.connections().len(), 3);
    net.simulate(1.0).unwrap();
}

#[test]
fn test_network_from_json_config() {
    let json = r#"{
        "kernel": { "resolution": 0.1, "num_threads": 2 },
        "nodes": [
            { "model": "spike_generator", "spike_times": [1.05, 3.33] },
            { "model": "iaf_psc_exp_ps", "crossing": { "mode": "interpolation", "order": 3 }, "count": 2 }
        ],
        "connections": [
            { "sources": [1], "targets": [2, 3], "weight": 8000.0, "delay": 1.25 }
        ],
        "record_membrane": [2],
        "simulation_time": 10.0
    }"#;
    let config = NetworkConfig::from_json(json).unwrap();
    let mut net = Network::from_config(&config).unwrap();
    assert_eq!(net.n_nodes(), 3);
    assert_eq!(net.connections().len(), 2);
    assert_eq!(
        net.neuron(2).unwrap().strategy(),
        CrossingStrategy::Interpolation { order: 3 }
    );

    net.simulate(config.simulation_time).unwrap();
    let trains = net.spike_data().spike_trains();
    assert_eq!(trains[&1].len(), 2);
    assert!(!trains[&2].is_empty());
    assert_eq!(trains[&2], trains[&3]);
    // fires after the first input arrives at 2.3 ms
    assert!(trains[&2][0] > 2.3);
    assert_eq!(net.membrane_trace(2).unwrap().unwrap().len(), 100);
    assert!(net.membrane_trace(3).unwrap().is_none());
}

#[test]
fn test_bad_json_is_reported() {
    let err = NetworkConfig::from_json(r#"{ "nodes": [ { "model": "hodgkin_huxley" } ] }"#).unwrap_err();
    assert!(matches!(err, NestError::Config(_)));
}

#[test]
fn test_stdp_keeps_archive_bounded() {
    let mut net = Network::new(kernel(0.1, 2)).unwrap();
    let pre = net
        .add_spike_generator(&SpikeGeneratorParams {
            spike_times: (0..100).map(|i| 5.0 * i as f64 + 0.37).collect(),
            spike_weights: vec![],
        })
        .unwrap();
    let post = net
        .create(&NodeSpec::IafPscExpPs {
            params: IafPscExpParams {
                i_e: 400.0,
                ..Default::default()
            },
            crossing: CrossingStrategy::StateSpace,
            count: 1,
        })
        .unwrap()
        .ids[0];
    net.connect(pre, post, 50.0, 1.0, &SynapseModel::Stdp(StdpParams::default()))
        .unwrap();
    net.simulate(500.0).unwrap();

    let trains = net.spike_data().spike_trains();
    assert!(trains[&post].len() > 5);
    let archive = net.neuron(post).unwrap().archive();
    assert_eq!(archive.reader_count(), 1);
    assert!(archive.len() <= 3, "archive holds {} entries", archive.len());
    assert!((net.connections()[0].weight - 50.0).abs() > 1e-6);

    assert_eq!(net.disconnect(pre, post).unwrap(), 1);
    assert_eq!(net.neuron(post).unwrap().archive().reader_count(), 0);
    assert!(net.connections().is_empty());
}

fn plastic_connection_made_mid_run(with_early_reader: bool) {
    let mut net = Network::new(kernel(0.1, 2)).unwrap();
    let pre = net
        .add_spike_generator(&SpikeGeneratorParams {
            spike_times: (0..40).map(|i| i as f64 + 0.55).collect(),
            spike_weights: vec![],
        })
        .unwrap();
    let post = net
        .create(&NodeSpec::IafPscExpPs {
            params: IafPscExpParams {
                i_e: 2000.0,
                ..Default::default()
            },
            crossing: CrossingStrategy::Bisection,
            count: 1,
        })
        .unwrap()
        .ids[0];
    net.connect(pre, post, 10.0, 10.0, &SynapseModel::Static).unwrap();
    if with_early_reader {
        net.connect(pre, post, 10.0, 1.0, &SynapseModel::Stdp(StdpParams::default()))
            .unwrap();
    }
    net.simulate(20.0).unwrap();

    net.connect(pre, post, 10.0, 10.0, &SynapseModel::Stdp(StdpParams::default()))
        .unwrap();
    net.simulate(20.0).unwrap();

    let readers = if with_early_reader { 2 } else { 1 };
    assert_eq!(net.neuron(post).unwrap().archive().reader_count(), readers);
    let late = net.connections().last().unwrap();
    assert!(late.is_plastic());
    assert!((late.weight - 10.0).abs() > 1e-9);
}

#[test]
fn test_stdp_connection_made_mid_run() {
    plastic_connection_made_mid_run(false);
}

#[test]
fn test_stdp_connection_made_mid_run_next_to_active_reader() {
    plastic_connection_made_mid_run(true);
}
