use criterion::{black_box, criterion_group, criterion_main, Criterion};
use phasespace::{
    generator::Generator, ChannelSettings, LegSettings, NodeSettings, ProcessSettings, Settings,
    TopologySettings,
};
use rand::{rngs::SmallRng, SeedableRng};

fn leg(i: usize) -> NodeSettings {
    NodeSettings::Leg(i)
}

fn decay(children: Vec<NodeSettings>) -> NodeSettings {
    NodeSettings::Decay {
        channel: ChannelSettings::default(),
        children,
    }
}

fn two_to_four() -> Settings {
    let mut settings = Settings::default();
    settings.kinematics.e_cm = 1000.;
    settings.process = ProcessSettings {
        incoming: vec![LegSettings::default(); 2],
        outgoing: vec![LegSettings::default(); 4],
        topologies: vec![
            TopologySettings {
                name: "s12_s34".to_owned(),
                tree: decay(vec![
                    decay(vec![leg(0), leg(1)]),
                    decay(vec![leg(2), leg(3)]),
                ]),
            },
            TopologySettings {
                name: "t_chain".to_owned(),
                tree: NodeSettings::Transfer {
                    exchanges: vec![],
                    channels: vec![],
                    outgoing: vec![leg(0), leg(1), leg(2), leg(3)],
                },
            },
        ],
        ..ProcessSettings::default()
    };
    settings
}

fn criterion_benchmark(c: &mut Criterion) {
    let settings = two_to_four();
    let mut group = c.benchmark_group("event generation");

    let mut generator = Generator::<4>::new(&settings).unwrap();
    let mut rng = SmallRng::seed_from_u64(1);
    group.bench_function("generate 2->4", |b| {
        b.iter(|| black_box(generator.generate(&mut rng)))
    });
    group.bench_function("generate and adapt 2->4", |b| {
        b.iter(|| {
            let point = generator.generate(&mut rng);
            black_box(generator.add_sample(1.));
            point.weight
        })
    });

    let mut generator = Generator::<4>::new(&settings).unwrap();
    let mut rng = SmallRng::seed_from_u64(2);
    let momenta = loop {
        let point = generator.generate(&mut rng);
        if point.is_valid() {
            break point.momenta;
        }
    };
    group.bench_function("evaluate external 2->4", |b| {
        b.iter(|| black_box(generator.evaluate_external(&momenta).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
