use crate::generator::Generator;
use crate::integrands::{integrand_factory, BreitWignerSettings, IntegrandSettings};
use crate::integrate::{generate_and_evaluate, integrate};
use crate::momentum::Momentum;
use crate::sampler::Density;
use crate::utils::{self, two_body_phase_space, ApproxEq, CONSERVATION_TOLERANCE};
use crate::{
    BeamSettings, ChannelSettings, LegSettings, NodeSettings, PairSampling, ProcessSettings,
    SamplingDirection, Settings, TopologySettings,
};
use colored::Colorize;
use rand::{rngs::SmallRng, SeedableRng};
use std::f64::consts::PI;

const CENTRAL_VALUE_TOLERANCE: f64 = 2.0e-2;
const DIFF_TARGET_TO_ERROR_MUST_BE_LESS_THAN: f64 = 4.;
const BASE_N_START_SAMPLE: usize = 20_000;

fn validate_error(error: f64, target_diff: f64) -> bool {
    if target_diff.abs() < 1.0e-12 {
        true
    } else {
        (target_diff / error).abs() < DIFF_TARGET_TO_ERROR_MUST_BE_LESS_THAN
    }
}

fn compare_integration<const D: usize>(
    settings: &Settings,
    target: f64,
    tolerance: Option<f64>,
) -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    let applied_tolerance = tolerance.unwrap_or(CENTRAL_VALUE_TOLERANCE);
    let mut generator = Generator::<D>::new(settings).unwrap();
    let integrand = integrand_factory(settings).unwrap();
    let res = integrate(&mut generator, &integrand, settings, Some(target));
    if ((res.result - target) / target).abs() > applied_tolerance
        || !validate_error(res.error, target - res.result)
    {
        println!(
            "Incorrect result: {:-19} vs {:.16e}",
            format!("{:-19}", utils::format_uncertainty(res.result, res.error))
                .red()
                .bold(),
            target
        );
        return false;
    }
    true
}

fn leg(i: usize) -> NodeSettings {
    NodeSettings::Leg(i)
}

fn decay(children: Vec<NodeSettings>) -> NodeSettings {
    decay_with(ChannelSettings::default(), children)
}

fn decay_with(channel: ChannelSettings, children: Vec<NodeSettings>) -> NodeSettings {
    NodeSettings::Decay { channel, children }
}

fn transfer(outgoing: Vec<NodeSettings>) -> NodeSettings {
    NodeSettings::Transfer {
        exchanges: vec![],
        channels: vec![],
        outgoing,
    }
}

fn topology(name: &str, tree: NodeSettings) -> TopologySettings {
    TopologySettings {
        name: name.to_owned(),
        tree,
    }
}

fn load_default_settings() -> Settings {
    let mut settings = Settings::default();
    settings.kinematics.e_cm = 10.;
    settings.integrator.n_start = BASE_N_START_SAMPLE;
    settings.integrator.n_increase = 0;
    settings.integrator.n_max = 5 * BASE_N_START_SAMPLE;
    settings.integrator.seed = 1;
    settings.multi_channeling.adapt_every = 0;
    settings
}

fn scattering(outgoing: Vec<LegSettings>, topologies: Vec<TopologySettings>) -> Settings {
    let mut settings = load_default_settings();
    settings.process = ProcessSettings {
        incoming: vec![LegSettings::default(); 2],
        outgoing,
        topologies,
        ..ProcessSettings::default()
    };
    settings
}

fn massless_three_body() -> Settings {
    scattering(
        vec![LegSettings::default(); 3],
        vec![
            topology("s12", decay(vec![decay(vec![leg(0), leg(1)]), leg(2)])),
            topology("s23", decay(vec![leg(0), decay(vec![leg(1), leg(2)])])),
            topology("t", transfer(vec![leg(0), leg(1), leg(2)])),
        ],
    )
}

fn conserves<const D: usize>(momenta: &[Momentum<D>], n_incoming: usize) -> bool {
    let mut balance = Momentum::<D>::zero();
    for (i, p) in momenta.iter().enumerate() {
        if i < n_incoming {
            balance += *p;
        } else {
            balance -= *p;
        }
    }
    balance.approx_eq(&Momentum::zero(), &CONSERVATION_TOLERANCE)
}

mod tests_phase_space_volume {
    use super::*;

    #[test]
    fn two_body_volume_is_exact_in_every_event() {
        let settings = scattering(
            vec![
                LegSettings {
                    mass: 3.,
                    width: 0.,
                },
                LegSettings {
                    mass: 4.,
                    width: 0.,
                },
            ],
            vec![topology("s", decay(vec![leg(0), leg(1)]))],
        );
        let target = two_body_phase_space(100., 9., 16., 4);
        let kallen = utils::kallen(100., 9., 16.);
        assert!(target.approx_eq(&(kallen.sqrt() / (8. * PI * 100.)), &1e-12));

        let mut generator = Generator::<4>::new(&settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..100 {
            let point = generator.generate(&mut rng);
            assert!(point.is_valid());
            assert!(point.weight.approx_eq(&target, &1e-10));
            assert!(conserves(&point.momenta, 2));
            assert!(point.outgoing()[0].square().approx_eq(&9., &1e-9));
            assert!(point.outgoing()[1].square().approx_eq(&16., &1e-9));
        }
        assert!(compare_integration::<4>(&settings, target, Some(1e-10)));
    }

    #[test]
    fn massless_two_body_in_six_dimensions() {
        let mut settings = scattering(
            vec![LegSettings::default(); 2],
            vec![topology("s", decay(vec![leg(0), leg(1)]))],
        );
        settings.kinematics.dimension = 6;
        let target = two_body_phase_space(100., 0., 0., 6);
        assert!(compare_integration::<6>(&settings, target, Some(1e-10)));
    }

    #[test]
    fn massless_three_body_volume() {
        let target = 100. / (256. * PI.powi(3));
        assert!(compare_integration::<4>(&massless_three_body(), target, None));
    }

    #[test]
    fn massless_three_body_forward_with_symmetric_pairs() {
        let mut settings = massless_three_body();
        settings.phase_space.sampling_direction = SamplingDirection::Forward;
        settings.phase_space.pair_sampling = PairSampling::Symmetric;
        let target = 100. / (256. * PI.powi(3));
        assert!(compare_integration::<4>(&settings, target, None));
    }

    #[test]
    fn transfer_chain_alone_gives_the_same_volume() {
        let settings = scattering(
            vec![LegSettings::default(); 3],
            vec![topology("t", transfer(vec![leg(0), leg(1), leg(2)]))],
        );
        let target = 100. / (256. * PI.powi(3));
        assert!(compare_integration::<4>(&settings, target, None));
    }

    #[test]
    fn three_body_decay_at_rest() {
        let mut settings = load_default_settings();
        settings.process = ProcessSettings {
            incoming: vec![LegSettings {
                mass: 10.,
                width: 0.,
            }],
            outgoing: vec![LegSettings::default(); 3],
            topologies: vec![
                topology("s23", decay(vec![leg(0), decay(vec![leg(1), leg(2)])])),
                topology("s13", decay(vec![leg(1), decay(vec![leg(0), leg(2)])])),
            ],
            ..ProcessSettings::default()
        };

        let mut generator = Generator::<4>::new(&settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(8);
        for _ in 0..50 {
            let point = generator.generate(&mut rng);
            assert!(point.is_valid());
            assert!(conserves(&point.momenta, 1));
            assert!(point.incoming()[0].square().approx_eq(&100., &1e-9));
        }

        let target = 100. / (256. * PI.powi(3));
        assert!(compare_integration::<4>(&settings, target, None));
    }

    #[test]
    fn hadronic_two_body_integrates_the_luminosity() {
        let mut settings = scattering(
            vec![LegSettings::default(); 2],
            vec![topology("s", decay(vec![leg(0), leg(1)]))],
        );
        let tau_min: f64 = 1.0e-2;
        settings.kinematics.beams = BeamSettings::Hadronic { tau_min };

        let mut generator = Generator::<4>::new(&settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(13);
        for _ in 0..50 {
            let point = generator.generate(&mut rng);
            assert!(point.is_valid());
            assert!(conserves(&point.momenta, 2));
            let s_hat = (point.incoming()[0] + point.incoming()[1]).square();
            assert!(s_hat.approx_eq(&(point.x1 * point.x2 * 100.), &1e-9));
            assert!(point.x1 <= 1. && point.x2 <= 1.);
        }

        let target = (1. - tau_min + tau_min * tau_min.ln()) / (8. * PI);
        assert!(compare_integration::<4>(&settings, target, None));
    }
}

mod tests_integrands {
    use super::*;

    /// `∫_0^s ds23 BW(s23) (1 - s23/s) / (128 π³)` for a massless 2 -> 3.
    fn breit_wigner_target(s: f64, mass: f64, width: f64) -> f64 {
        let a = mass * mass;
        let b = mass * width;
        let primitive =
            |x: f64| (1. - a / s) / b * ((x - a) / b).atan() - ((x - a).powi(2) + b * b).ln() / (2. * s);
        (primitive(s) - primitive(0.)) / (128. * PI.powi(3))
    }

    #[test]
    fn resonance_is_found_by_the_adapted_channels() {
        let (mass, width) = (5., 0.5);
        let resonant = ChannelSettings {
            sampling: Density::BreitWigner { mass, width },
            adaptive: false,
        };
        let mut settings = scattering(
            vec![LegSettings::default(); 3],
            vec![
                topology("flat", decay(vec![leg(1), decay(vec![leg(0), leg(2)])])),
                topology(
                    "resonant",
                    decay(vec![leg(0), decay_with(resonant, vec![leg(1), leg(2)])]),
                ),
            ],
        );
        settings.integrand = IntegrandSettings::BreitWigner(BreitWignerSettings {
            legs: vec![1, 2],
            mass,
            width,
        });
        settings.integrator.n_max = 10 * BASE_N_START_SAMPLE;

        let target = breit_wigner_target(100., mass, width);
        assert!(compare_integration::<4>(&settings, target, None));

        let mut generator = Generator::<4>::new(&settings).unwrap();
        let integrand = integrand_factory(&settings).unwrap();
        integrate(&mut generator, &integrand, &settings, Some(target));
        assert!(generator.alphas()[1] > generator.alphas()[0]);
    }

    #[test]
    fn each_event_enters_the_statistics_with_its_own_weight() {
        let settings = massless_three_body();
        let mut generator = Generator::<4>::new(&settings).unwrap();
        let integrand = integrand_factory(&settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let n = 1000;
        let mut weight_sum = 0.;
        for _ in 0..n {
            let (point, result) = generate_and_evaluate(&mut generator, &integrand, &mut rng, 0);
            assert_eq!(result.integrand_result, point.weight);
            weight_sum += point.weight;
        }
        let stats = generator.statistics();
        assert_eq!(stats.n(), n);
        assert!(weight_sum > 0.);
        assert!(stats.mean().approx_eq(&(weight_sum / n as f64), &1e-12));
    }

    #[test]
    fn adaptive_grids_keep_the_volume() {
        let mut settings = massless_three_body();
        if let NodeSettings::Decay { children, .. } = &mut settings.process.topologies[1].tree {
            if let NodeSettings::Decay { channel, .. } = &mut children[1] {
                channel.adaptive = true;
            }
        }
        settings.multi_channeling.adapt_every = 1000;
        let target = 100. / (256. * PI.powi(3));
        assert!(compare_integration::<4>(&settings, target, None));
    }
}

mod tests_settings {
    use super::*;

    const RUN_CARD: &str = "
General:
  debug: 0
Kinematics:
  e_cm: 91.188
  beams: fixed
Process:
  incoming: [{}, {}]
  outgoing: [{}, {}, {mass: 4.7}]
  topologies:
    - name: s12
      tree:
        decay:
          children:
            - decay:
                channel:
                  sampling:
                    power_law: {exponent: 1.0, offset: 0.0}
                  adaptive: true
                children: [{leg: 0}, {leg: 1}]
            - leg: 2
    - name: t
      tree:
        transfer:
          outgoing: [{leg: 0}, {leg: 1}, {leg: 2}]
PhaseSpace:
  sampling_direction: forward
  pair_sampling: symmetric
MultiChanneling:
  beta: 0.25
  pruning_threshold: 0.001
  adapt_every: 500
Integrator:
  n_start: 1000
  n_increase: 0
  n_max: 4000
  seed: 3
Integrand:
  type: unit
";

    #[test]
    fn run_card_is_parsed_and_generates_events() {
        let settings = Settings::from_yaml_str(RUN_CARD).unwrap();
        assert_eq!(settings.process.topologies.len(), 2);
        assert_eq!(settings.process.outgoing[2].mass, 4.7);
        assert_eq!(
            settings.phase_space.sampling_direction,
            SamplingDirection::Forward
        );
        assert_eq!(settings.integrand, IntegrandSettings::Unit);

        let mut generator = Generator::<4>::new(&settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(settings.integrator.seed);
        let mut n_valid = 0;
        for _ in 0..200 {
            let point = generator.generate(&mut rng);
            if point.is_valid() {
                n_valid += 1;
                assert!(conserves(&point.momenta, 2));
                assert!(point.outgoing()[2].square().approx_eq(&(4.7 * 4.7), &1e-9));
            }
            generator.add_sample(1.);
        }
        assert!(n_valid > 0);
    }

    #[test]
    fn shipped_run_card_is_loaded() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/run_card.yaml");
        let settings = Settings::from_file(path).unwrap();
        assert_eq!(settings.kinematics.e_cm, 91.188);
        assert_eq!(settings.process.topologies.len(), 3);
        assert!(matches!(
            settings.process.topologies[2].tree,
            NodeSettings::Transfer { .. }
        ));
        assert!(matches!(
            settings.integrand,
            IntegrandSettings::BreitWigner(BreitWignerSettings { mass, .. }) if mass == 80.4
        ));

        let mut generator = Generator::<4>::new(&settings).unwrap();
        assert_eq!(generator.topologies().len(), 3);
        let mut rng = SmallRng::seed_from_u64(1);
        let n_valid = (0..100)
            .filter(|_| generator.generate(&mut rng).is_valid())
            .count();
        assert!(n_valid > 0);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let card = "
Kinematics:
  e_cm: 10.0
Process:
  incoming: [{}, {}]
  outgoing: [{}, {}]
  topologies:
    - tree:
        decay:
          children: [{leg: 0}, {leg: 1}]
PhaseSpace:
  grid:
    n_bins: 16
MultiChanneling:
  beta: 1.0
Integrator:
  seed: 7
";
        let settings = Settings::from_yaml_str(card).unwrap();
        let defaults = Settings::default();
        assert_eq!(settings.phase_space.grid.n_bins, 16);
        assert_eq!(
            settings.phase_space.grid.learning_rate,
            defaults.phase_space.grid.learning_rate
        );
        assert_eq!(settings.multi_channeling.beta, 1.0);
        assert_eq!(
            settings.multi_channeling.adapt_every,
            defaults.multi_channeling.adapt_every
        );
        assert_eq!(settings.integrator.seed, 7);
        assert_eq!(settings.integrator.n_start, defaults.integrator.n_start);
        assert_eq!(settings.integrator.n_max, defaults.integrator.n_max);
        assert_eq!(settings.integrand, IntegrandSettings::Unit);
    }

    #[test]
    fn malformed_run_cards_are_rejected() {
        assert!(Settings::from_yaml_str("Kinematics: {e_cm: 1.0}\n").is_err());
        let mut settings = Settings::from_yaml_str(RUN_CARD).unwrap();
        settings.kinematics.dimension = 5;
        assert!(Generator::<4>::new(&settings).is_err());
    }
}
