//! Forward simulation over independent replicates
//!
//! Each replicate repeatedly takes the records its continuation predicate
//! keeps, copies them one cycle forward, fires every layer in order (running
//! the updaters anchored around them) and appends the new rows to its history.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::time::{Duration, Instant};

use super::config::{CancellationToken, FailurePolicy, SimulationConfig};
use super::state::{SimulationState, TerminationReason};
use crate::data::{Dataset, Record};
use crate::error::{Error, Result};
use crate::model::{Anchor, Draw, FittedLayer, Layer, Model};

/// How a successful replicate ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateOutcome {
    pub replicate: u32,
    pub cycles_run: u32,
    pub termination: TerminationReason,
}

/// Result of a simulation run
#[derive(Debug)]
pub struct SimulationReport {
    /// Rows of every successful replicate, replicate by replicate
    pub dataset: Dataset,

    /// One entry per successful replicate
    pub replicates: Vec<ReplicateOutcome>,

    /// Failed replicates (only populated under [`FailurePolicy::Partial`])
    pub failures: Vec<Error>,
}

impl SimulationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs a fitted model forward
pub struct Simulator<'m> {
    model: &'m Model,
    config: SimulationConfig,
    cancellation: CancellationToken,
}

impl<'m> Simulator<'m> {
    pub fn new(model: &'m Model, config: SimulationConfig) -> Self {
        Self {
            model,
            config,
            cancellation: CancellationToken::default(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Simulate replicates `1..=n_replicates` from `initial`
    pub fn run<P>(&self, n_replicates: u32, continuation: P, initial: &Dataset) -> Result<SimulationReport>
    where
        P: Fn(&Record) -> bool + Sync,
    {
        let pairs = self.model.fitted_pairs()?;
        if n_replicates == 0 {
            return Err(Error::configuration("at least one replicate is required"));
        }
        for (layer, _) in &pairs {
            initial.require_column(layer.name())?;
        }

        let start = Instant::now();
        let deadline = self.config.deadline_ms.map(|ms| start + Duration::from_millis(ms));
        info!(
            "Simulating {} replicates from {} rows (max {} cycles, seed {})",
            n_replicates,
            initial.len(),
            self.config.max_cycles,
            self.config.seed
        );

        let run_one = |replicate: u32| {
            (replicate, self.run_replicate(replicate, &pairs, &continuation, initial, deadline))
        };
        let results: Vec<(u32, Result<SimulationState>)> = if self.config.parallel {
            (1..=n_replicates).into_par_iter().map(run_one).collect()
        } else {
            (1..=n_replicates).map(run_one).collect()
        };

        let mut dataset = Dataset::new(initial.columns().to_vec());
        let mut replicates = Vec::with_capacity(results.len());
        let mut failures = Vec::new();

        for (replicate, result) in results {
            match result {
                Ok(state) => {
                    replicates.push(ReplicateOutcome {
                        replicate,
                        cycles_run: state.cycles_run,
                        termination: state.termination().unwrap_or(TerminationReason::Exhausted),
                    });
                    dataset = dataset.concat(state.history)?;
                }
                Err(err) => {
                    warn!("Replicate {} failed: {}", replicate, err);
                    failures.push(err);
                }
            }
        }

        if self.config.failure_policy == FailurePolicy::Abort && !failures.is_empty() {
            return Err(failures.swap_remove(0));
        }

        info!(
            "Simulation finished in {:?}: {} rows, {} replicates ok, {} failed",
            start.elapsed(),
            dataset.len(),
            replicates.len(),
            failures.len()
        );

        Ok(SimulationReport { dataset, replicates, failures })
    }

    fn run_replicate<P>(
        &self,
        replicate: u32,
        pairs: &[(&Layer, &FittedLayer)],
        continuation: &P,
        initial: &Dataset,
        deadline: Option<Instant>,
    ) -> Result<SimulationState>
    where
        P: Fn(&Record) -> bool,
    {
        let mut rng = StdRng::seed_from_u64(self.config.replicate_seed(replicate));
        let mut state = SimulationState::new(replicate, initial);

        while state.is_active() {
            let active = state.take_active(continuation);
            if active.is_empty() {
                state.terminate(TerminationReason::Exhausted);
                break;
            }
            if state.cycles_run >= self.config.max_cycles {
                warn!(
                    "Replicate {} stopped at the cap of {} cycles with {} records still active",
                    replicate,
                    self.config.max_cycles,
                    active.len()
                );
                state.terminate(TerminationReason::CycleCap);
                break;
            }

            let cycle = active.max_cycle().unwrap_or(0).saturating_add(1);
            self.check_interrupt(replicate, cycle, deadline)?;
            let generated = self.run_cycle(pairs, active, &mut rng)?;
            debug!("Replicate {} cycle {}: {} rows generated", replicate, cycle, generated.len());
            state
                .advance(generated)
                .map_err(|e| in_replicate(e, replicate, cycle, None))?;
        }

        Ok(state)
    }

    /// One full pass of every layer over the active records
    fn run_cycle(&self, pairs: &[(&Layer, &FittedLayer)], active: Dataset, rng: &mut StdRng) -> Result<Dataset> {
        let updaters = self.model.updaters();
        let replicate = active.rows().first().and_then(|r| r.replicate).unwrap_or(0);
        let cycle = active.max_cycle().unwrap_or(0).saturating_add(1);

        let mut next = updaters.apply_anchor(active.next_cycle()?, &Anchor::StartOfCycle)?;
        for (layer, fitted) in pairs {
            let (generated, _) = layer
                .generate(Some(fitted), next, &mut Draw::Sample(&mut *rng))
                .map_err(|e| in_replicate(e, replicate, cycle, Some(layer.name())))?;
            next = updaters.apply_anchor(generated, &Anchor::after(layer.name()))?;
        }
        updaters.apply_anchor(next, &Anchor::EndOfCycle)
    }

    /// Fails when the run was cancelled or ran past its deadline before `cycle`
    fn check_interrupt(&self, replicate: u32, cycle: u32, deadline: Option<Instant>) -> Result<()> {
        let reason = if self.cancellation.is_cancelled() {
            "cancelled".to_string()
        } else if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            format!("deadline of {} ms exceeded", self.config.deadline_ms.unwrap_or(0))
        } else {
            return Ok(());
        };
        Err(Error::Simulation {
            replicate,
            cycle,
            layer: None,
            record: None,
            reason,
        })
    }
}

/// Attach replicate context to a failure raised inside a cycle
fn in_replicate(err: Error, replicate: u32, cycle: u32, layer: Option<&str>) -> Error {
    match err {
        Error::Simulation { .. } => err,
        other => Error::Simulation {
            replicate,
            cycle,
            layer: layer.map(str::to_string),
            record: None,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::estimator::{Estimator, EstimatorError, FittedEstimator, FormulaSpec, Glm, Prediction};
    use crate::model::{formulas, LayerOptions, Transformation};
    use crate::synthetic::{generate_claims, SyntheticConfig};
    use std::collections::BTreeSet;

    /// Same prediction for every record
    #[derive(Debug, Clone, Copy)]
    struct Fixed(Prediction);

    impl Estimator for Fixed {
        fn fit(&self, _: &Dataset, _: &str, _: &FormulaSpec) -> std::result::Result<Box<dyn FittedEstimator>, EstimatorError> {
            Ok(Box::new(*self))
        }
    }

    impl FittedEstimator for Fixed {
        fn predict_record(&self, _: &Record) -> std::result::Result<Prediction, EstimatorError> {
            Ok(self.0)
        }
    }

    /// Value of another column plus a constant
    #[derive(Debug, Clone, Copy)]
    struct CopyPlus {
        from: &'static str,
        by: f64,
    }

    impl Estimator for CopyPlus {
        fn fit(&self, _: &Dataset, _: &str, _: &FormulaSpec) -> std::result::Result<Box<dyn FittedEstimator>, EstimatorError> {
            Ok(Box::new(*self))
        }
    }

    impl FittedEstimator for CopyPlus {
        fn predict_record(&self, record: &Record) -> std::result::Result<Prediction, EstimatorError> {
            let base = record.numeric(self.from).ok_or(EstimatorError::MissingCovariate {
                column: self.from.to_string(),
            })?;
            Ok(Prediction::Point(base + self.by))
        }
    }

    /// Fails for every record of one replicate
    #[derive(Debug, Clone, Copy)]
    struct FailIn(u32);

    impl Estimator for FailIn {
        fn fit(&self, _: &Dataset, _: &str, _: &FormulaSpec) -> std::result::Result<Box<dyn FittedEstimator>, EstimatorError> {
            Ok(Box::new(*self))
        }
    }

    impl FittedEstimator for FailIn {
        fn predict_record(&self, record: &Record) -> std::result::Result<Prediction, EstimatorError> {
            if record.replicate == Some(self.0) {
                Err(EstimatorError::UnseenLevel { column: "kind".into(), level: "marine".into() })
            } else {
                Ok(Prediction::Point(1.0))
            }
        }
    }

    fn table(columns: &[&str], rows: Vec<Record>) -> Dataset {
        Dataset::from_records(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    fn sequential() -> SimulationConfig {
        SimulationConfig { parallel: false, ..SimulationConfig::default() }
    }

    fn fit_all(model: Model) -> Model {
        let names: Vec<String> = model.layers().iter().map(|l| l.name().to_string()).collect();
        let specs = formulas(names.iter().map(|n| (n.clone(), format!("{} ~ 1", n))));
        model.fit(&specs).unwrap()
    }

    fn rows_of<'a>(data: &'a Dataset, id: &str) -> Vec<&'a Record> {
        data.rows().iter().filter(|r| r.id == id).collect()
    }

    #[test]
    fn test_layer_sees_fresh_value_within_cycle() {
        let data = table(&["a", "b"], vec![Record::new("X", 1).with("a", 0.0).with("b", 0.0)]);

        let a = CopyPlus { from: "cycle", by: 100.0 };
        let b = CopyPlus { from: "a", by: 1.0 };
        let in_order = fit_all(
            Model::new(data.clone())
                .add_layer("a", a, LayerOptions::default()).unwrap()
                .add_layer("b", b, LayerOptions::default()).unwrap(),
        );
        let out = in_order.simulate_with(&sequential(), 1, |r| r.cycle < 3, &data).unwrap();

        let x = rows_of(&out, "X");
        assert_eq!(x.len(), 3);
        assert_eq!(x[1].numeric("a"), Some(102.0));
        assert_eq!(x[1].numeric("b"), Some(103.0));
        assert_eq!(x[2].numeric("b"), Some(104.0));

        let reversed = fit_all(
            Model::new(data.clone())
                .add_layer("b", b, LayerOptions::default()).unwrap()
                .add_layer("a", a, LayerOptions::default()).unwrap(),
        );
        let out = reversed.simulate_with(&sequential(), 1, |r| r.cycle < 3, &data).unwrap();
        let x = rows_of(&out, "X");
        // "b" now sees the previous cycle's "a"
        assert_eq!(x[1].numeric("b"), Some(1.0));
        assert_eq!(x[2].numeric("b"), Some(103.0));
    }

    #[test]
    fn test_cycle_cap_terminates_endless_predicate() {
        let data = table(&["n"], vec![Record::new("A", 0).with("n", 0.0), Record::new("B", 2).with("n", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("n", Fixed(Prediction::Point(1.0)), LayerOptions::default())
                .unwrap(),
        );
        let config = SimulationConfig { max_cycles: 4, ..sequential() };
        let report = Simulator::new(&model, config).run(1, |_| true, &data).unwrap();

        assert_eq!(report.replicates[0].termination, TerminationReason::CycleCap);
        assert_eq!(report.replicates[0].cycles_run, 4);
        assert_eq!(rows_of(&report.dataset, "A").len(), 5);
        assert_eq!(rows_of(&report.dataset, "B").last().unwrap().cycle, 6);
    }

    #[test]
    fn test_replicate_independent_of_batch() {
        let data = table(&["noise"], vec![Record::new("A", 1).with("noise", 0.0), Record::new("B", 1).with("noise", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("noise", Fixed(Prediction::Normal { mean: 0.0, sd: 1.0 }), LayerOptions::default())
                .unwrap(),
        );
        let keep = |r: &Record| r.cycle < 5;

        let batch = model.simulate_with(&sequential(), 2, keep, &data).unwrap();
        let alone = model.simulate_with(&sequential(), 1, keep, &data).unwrap();
        let first_of_batch = batch.filter(|r| r.replicate == Some(1));
        assert_eq!(first_of_batch, alone);

        let second_of_batch = batch.filter(|r| r.replicate == Some(2));
        let noise = |d: &Dataset| d.rows().iter().filter_map(|r| r.numeric("noise")).collect::<Vec<_>>();
        assert_ne!(noise(&first_of_batch), noise(&second_of_batch));

        let parallel = model.simulate_with(&SimulationConfig::default(), 2, keep, &data).unwrap();
        assert_eq!(parallel, batch);
    }

    #[test]
    fn test_frozen_record_preserved() {
        let data = table(
            &["close", "paid"],
            vec![
                Record::new("A", 6).with("close", 0.0).with("paid", 10.0),
                Record::new("B", 6).with("close", 1.0).with("paid", 55.0),
            ],
        );
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("close", Fixed(Prediction::Point(0.0)), LayerOptions::default())
                .unwrap(),
        );
        let out = model
            .simulate_with(&sequential(), 1, |r| r.cycle <= 7 && !r.flag("close"), &data)
            .unwrap();

        let b = rows_of(&out, "B");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].cycle, 6);
        assert_eq!(b[0].numeric("paid"), Some(55.0));
        assert!(b[0].flag("close"));

        let a_cycles: Vec<u32> = rows_of(&out, "A").iter().map(|r| r.cycle).collect();
        assert_eq!(a_cycles, vec![6, 7, 8]);
    }

    #[test]
    fn test_filter_applies_during_generation() {
        let data = table(&["payment", "size"], vec![Record::new("A", 1).with("payment", 0.0).with("size", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("payment", Fixed(Prediction::Bernoulli { p: 0.5 }), LayerOptions::default())
                .unwrap()
                .add_layer("size", Fixed(Prediction::Point(250.0)), LayerOptions::filtered(|r| r.flag("payment")))
                .unwrap(),
        );
        let out = model.simulate_with(&sequential(), 20, |r| r.cycle < 4, &data).unwrap();

        let mut paid_rows = 0;
        for row in out.rows().iter().filter(|r| r.cycle > 1) {
            if row.flag("payment") {
                paid_rows += 1;
                assert_eq!(row.numeric("size"), Some(250.0));
            } else {
                assert_eq!(row.numeric("size"), Some(0.0));
            }
        }
        assert!(paid_rows > 0);
    }

    #[test]
    fn test_updater_anchors_fire_in_cycle_order() {
        let data = table(
            &["size", "prev_size", "paid", "steps"],
            vec![Record::new("A", 1).with("size", 5.0).with("prev_size", 0.0).with("paid", 0.0).with("steps", 0.0)],
        );
        let copy_column = |from: &'static str, to: &'static str| {
            move |mut d: Dataset| {
                for row in d.rows_mut() {
                    let v = row.numeric(from).unwrap_or(0.0);
                    row.set(to, Value::Number(v));
                }
                d
            }
        };
        let accumulate = |column: &'static str, from: Option<&'static str>| {
            move |mut d: Dataset| {
                for row in d.rows_mut() {
                    let add = from.and_then(|f| row.numeric(f)).unwrap_or(1.0);
                    let current = row.numeric(column).unwrap_or(0.0);
                    row.set(column, Value::Number(current + add));
                }
                d
            }
        };

        let model = fit_all(
            Model::new(data.clone())
                .add_layer("size", Fixed(Prediction::Point(10.0)), LayerOptions::default())
                .unwrap(),
        )
        .register_updater("lag size", copy_column("size", "prev_size"), Anchor::StartOfCycle)
        .unwrap()
        .register_updater("paid to date", accumulate("paid", Some("size")), Anchor::after("size"))
        .unwrap()
        .register_updater("count steps", accumulate("steps", None), Anchor::EndOfCycle)
        .unwrap();

        let out = model.simulate_with(&sequential(), 1, |r| r.cycle < 3, &data).unwrap();
        let rows = rows_of(&out, "A");
        assert_eq!(rows[1].numeric("prev_size"), Some(5.0));
        assert_eq!(rows[1].numeric("paid"), Some(10.0));
        assert_eq!(rows[1].numeric("steps"), Some(1.0));
        assert_eq!(rows[2].numeric("prev_size"), Some(10.0));
        assert_eq!(rows[2].numeric("paid"), Some(20.0));
        assert_eq!(rows[2].numeric("steps"), Some(2.0));
    }

    #[test]
    fn test_simulate_requires_fit_and_columns() {
        let data = table(&["close"], vec![Record::new("A", 1).with("close", 0.0)]);
        let model = Model::new(data.clone())
            .add_layer("close", Fixed(Prediction::Point(0.0)), LayerOptions::default())
            .unwrap();
        assert!(matches!(model.simulate(1, |_| true, &data), Err(Error::LayerNotFitted { .. })));

        let fitted = fit_all(model);
        let bare = table(&[], vec![Record::new("A", 1)]);
        assert!(matches!(fitted.simulate(1, |_| true, &bare), Err(Error::Schema { .. })));
        assert!(matches!(fitted.simulate(0, |_| true, &data), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_failure_isolated_to_replicate() {
        let data = table(&["size"], vec![Record::new("C7", 3).with("size", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("size", FailIn(2), LayerOptions::default())
                .unwrap(),
        );
        let partial = SimulationConfig { failure_policy: FailurePolicy::Partial, ..SimulationConfig::default() };
        let report = Simulator::new(&model, partial).run(3, |r| r.cycle < 5, &data).unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        match &report.failures[0] {
            Error::Simulation { replicate, cycle, layer, record, .. } => {
                assert_eq!(*replicate, 2);
                assert_eq!(*cycle, 4);
                assert_eq!(layer.as_deref(), Some("size"));
                assert_eq!(record.as_deref(), Some("C7"));
            }
            other => panic!("expected simulation error, got {:?}", other),
        }
        let ids: Vec<u32> = report.dataset.replicate_ids().into_iter().collect();
        assert_eq!(ids, vec![1, 3]);

        let aborted = model.simulate(3, |r| r.cycle < 5, &data).unwrap_err();
        assert_eq!(aborted.replicate(), Some(2));
    }

    #[test]
    fn test_cancellation_and_deadline() {
        let data = table(&["n"], vec![Record::new("A", 1).with("n", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("n", Fixed(Prediction::Point(1.0)), LayerOptions::default())
                .unwrap(),
        );

        let token = CancellationToken::new();
        token.cancel();
        let partial = SimulationConfig { failure_policy: FailurePolicy::Partial, ..sequential() };
        let report = Simulator::new(&model, partial.clone())
            .with_cancellation(token)
            .run(3, |_| true, &data)
            .unwrap();
        assert_eq!(report.failures.len(), 3);
        assert!(report.dataset.is_empty());
        // interrupted before the first projected cycle
        assert!(matches!(report.failures[0], Error::Simulation { cycle: 2, .. }));

        let expired = SimulationConfig { deadline_ms: Some(0), ..sequential() };
        let err = Simulator::new(&model, expired).run(1, |_| true, &data).unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn test_interrupts_ignored_when_no_cycle_remains() {
        let data = table(&["n"], vec![Record::new("A", 1).with("n", 0.0)]);
        let model = fit_all(
            Model::new(data.clone())
                .add_layer("n", Fixed(Prediction::Point(1.0)), LayerOptions::default())
                .unwrap(),
        );

        let expired = Simulator::new(&model, SimulationConfig { deadline_ms: Some(0), ..sequential() });
        assert_eq!(expired.config().deadline_ms, Some(0));
        let report = expired.run(1, |_| false, &data).unwrap();
        assert_eq!(report.dataset, data.clone().with_replicate(1));
        assert_eq!(
            report.replicates,
            vec![ReplicateOutcome { replicate: 1, cycles_run: 0, termination: TerminationReason::Exhausted }]
        );

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = Simulator::new(&model, sequential()).with_cancellation(token);
        assert!(cancelled.run(2, |_| false, &data).unwrap().is_complete());
    }

    #[test]
    fn test_close_payment_size_scenario() {
        let training = generate_claims(&SyntheticConfig { rows: 100, ..SyntheticConfig::default() }).unwrap();
        assert_eq!(training.len(), 100);

        let model = Model::new(training)
            .add_layer("close", Glm::binomial(), LayerOptions::default())
            .unwrap()
            .add_layer("payment", Glm::binomial(), LayerOptions::default())
            .unwrap()
            .add_layer(
                "size",
                Glm::gaussian(),
                LayerOptions::filtered(|r| r.flag("payment")).with_transformation(Transformation::Log),
            )
            .unwrap();
        let model = model
            .fit(&formulas([
                ("close", "close ~ cycle + factor(kind)"),
                ("payment", "payment ~ close + cycle"),
                ("size", "size ~ cycle"),
            ]))
            .unwrap();

        let open: Vec<Record> = (0..8)
            .map(|i| {
                Record::new(format!("OPEN{}", i), 6)
                    .with("kind", if i % 2 == 0 { "property" } else { "liability" })
                    .with("close", 0.0)
                    .with("payment", 0.0)
                    .with("size", 0.0)
                    .with("paid_to_date", 0.0)
                    .with("prev_payment", 0.0)
            })
            .collect();
        let initial = Dataset::from_records(model.training_data().columns().to_vec(), open).unwrap();

        let out = model
            .simulate(5, |r| r.cycle <= 6 && !r.flag("close"), &initial)
            .unwrap();

        let replicates: BTreeSet<u32> = out.replicate_ids();
        assert_eq!(replicates.len(), 5);
        assert!(out.rows().iter().all(|r| r.flag("payment") || r.numeric("size") == Some(0.0)));
        assert!(out.rows().iter().all(|r| r.cycle <= 7));
        // 8 starting rows plus one projected row per record, per replicate
        assert_eq!(out.len(), 5 * 16);
        assert!(out
            .rows()
            .iter()
            .filter(|r| r.flag("payment"))
            .all(|r| r.numeric("size").unwrap() > 0.0));
    }
}
