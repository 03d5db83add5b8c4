//! End-to-end allocation scenarios.
//!
//! Each test seeds an in-memory reference store through the real loader,
//! builds a site context, and runs the engine (or the full job service)
//! exactly as a worker would.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bng_optimiser::allocation::{AllocationEngine, EngineSettings};
use bng_optimiser::geography::{GeographyResolver, SiteContext, SiteInput};
use bng_optimiser::jobs::{DemandSpec, JobInputs, JobService, ResultCache};
use bng_optimiser::models::{
    Config, DemandLine, Distinctiveness, Ledger, OptionKind, SolverSelection, Tier,
};
use bng_optimiser::reference::ReferenceStore;

fn seeded_store(extra_sql: &str) -> Arc<ReferenceStore> {
    let store = ReferenceStore::in_memory().expect("in-memory store");
    store
        .with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO DistinctivenessLevels VALUES
                    ('Very Low', 0), ('Low', 1), ('Medium', 2), ('High', 3), ('Very High', 4);",
            )?;
            conn.execute_batch(extra_sql)
        })
        .expect("seed reference rows");
    Arc::new(store)
}

fn site_in(lpa: &str, nca: &str) -> SiteContext {
    SiteContext {
        lpa_name: lpa.to_string(),
        nca_name: nca.to_string(),
        lpa_neighbours: HashSet::new(),
        nca_neighbours: HashSet::new(),
        waterbody_id: None,
        operational_catchment_id: None,
    }
}

fn check_row_invariants(report: &bng_optimiser::models::AllocationReport) {
    for row in &report.allocations {
        let expected = row.units_supplied * row.unit_price;
        assert!(
            (row.cost - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "cost {} != units {} x price {}",
            row.cost,
            row.units_supplied,
            row.unit_price
        );
        assert!(row.units_supplied > 0.0);
        assert!(row.stock_units_consumed >= 0.0);
    }
}

#[test]
fn scenario_local_same_habitat() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Grassland - Other neutral grassland', 'Grassland', 'Medium', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Meadow Bank', 'Lichfield', 'Arden');
         INSERT INTO Stock VALUES ('B1', 'Grassland - Other neutral grassland', 10.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Grassland - Other neutral grassland', 'fractional', 'local', 25000.0);",
    );
    let reference = store.snapshot().unwrap();
    let site = site_in("Lichfield", "Cannock Chase");

    let demand = vec![DemandLine {
        ledger: Ledger::Area,
        habitat_name: "Grassland - Other neutral grassland".to_string(),
        units_required: 0.5,
        distinctiveness: Distinctiveness::Medium,
        broader_type: Some("Grassland".to_string()),
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    assert_eq!(report.allocations.len(), 1);
    let row = &report.allocations[0];
    assert_eq!(row.bank_id, "B1");
    assert_eq!(row.tier, Tier::Local);
    assert!((row.units_supplied - 0.5).abs() < 1e-9);
    assert!((row.stock_units_consumed - 0.5).abs() < 1e-9);
    assert!((row.cost - 12_500.0).abs() < 1e-6);
    assert!(report.shortfalls.is_empty());
    check_row_invariants(&report);
}

#[test]
fn scenario_adjacent_substitute_pairs() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Urban - Individual trees', 'Urban', 'Medium', 'area'),
            ('Orchard - Traditional orchard', 'Orchard', 'High', 'area'),
            ('Heathland - Mixed scrub', 'Heathland and shrub', 'Medium', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Orchard Bank', 'Warwick', 'Cotswolds');
         INSERT INTO Stock VALUES
            ('B1', 'Orchard - Traditional orchard', 1.0, 0.0),
            ('B1', 'Heathland - Mixed scrub', 1.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Orchard - Traditional orchard', 'fractional', 'adjacent', 32800.0),
            ('B1', 'Heathland - Mixed scrub', 'fractional', 'adjacent', 20000.0);",
    );
    let reference = store.snapshot().unwrap();
    let mut site = site_in("Stratford-on-Avon", "Arden");
    site.lpa_neighbours.insert("Warwick".to_string());

    let demand = vec![DemandLine {
        ledger: Ledger::Area,
        habitat_name: "Urban - Individual trees".to_string(),
        units_required: 0.07,
        distinctiveness: Distinctiveness::Medium,
        broader_type: Some("Urban".to_string()),
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    // The blended pair at 0.75 x 32,800 + 0.25 x 20,000 = 29,600 beats the
    // single-habitat option.
    assert!((report.total_cost - 2_072.0).abs() < 1e-6);
    assert_eq!(report.allocations.len(), 2);
    assert!(report
        .allocations
        .iter()
        .all(|row| row.option_kind == OptionKind::Paired));

    let main = report
        .allocations
        .iter()
        .find(|r| r.supply_habitat == "Orchard - Traditional orchard")
        .expect("main component row");
    let companion = report
        .allocations
        .iter()
        .find(|r| r.supply_habitat == "Heathland - Mixed scrub")
        .expect("companion component row");

    assert!((main.units_supplied - 0.0525).abs() < 1e-9);
    assert!((companion.units_supplied - 0.0175).abs() < 1e-9);
    // Component weights recombine to the demanded quantity.
    assert!((main.units_supplied + companion.units_supplied - 0.07).abs() < 1e-9);

    let parts = main.paired_parts.as_ref().expect("blend description");
    assert_eq!(parts.len(), 2);
    assert!((parts[0].weight + parts[1].weight - 1.0).abs() < 1e-12);

    assert!(report.shortfalls.is_empty());
    check_row_invariants(&report);
}

#[test]
fn scenario_far_watercourse_outside_catchment() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Rivers and streams', 'Watercourses', 'High', 'watercourse');
         INSERT INTO Banks VALUES
            ('B1', 'River Bank', 'Derbyshire Dales', 'White Peak',
             NULL, NULL, NULL, 'GB000200000001', 'OC-99');
         INSERT INTO Stock VALUES ('B1', 'Rivers and streams', 5.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Rivers and streams', 'fractional', 'far', 40000.0);",
    );
    let reference = store.snapshot().unwrap();
    let mut site = site_in("Lichfield", "Cannock Chase");
    site.waterbody_id = Some("GB000100000009".to_string());
    site.operational_catchment_id = Some("OC-01".to_string());

    let demand = vec![DemandLine {
        ledger: Ledger::Watercourse,
        habitat_name: "Rivers and streams".to_string(),
        units_required: 1.0,
        distinctiveness: Distinctiveness::High,
        broader_type: None,
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    assert_eq!(report.allocations.len(), 1);
    let row = &report.allocations[0];
    assert_eq!(row.tier, Tier::Far);
    // Far watercourse yield is 0.5: two raw units per effective unit.
    assert!((row.units_supplied - 1.0).abs() < 1e-9);
    assert!((row.stock_units_consumed - 2.0).abs() < 1e-9);
    assert!((row.cost - 40_000.0).abs() < 1e-6);
    assert!(report.shortfalls.is_empty());
    check_row_invariants(&report);
}

#[test]
fn scenario_trading_rule_scopes_supply() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Wetland - Reedbeds', 'Wetland', 'High', 'area'),
            ('Wetland - Fens', 'Wetland', 'High', 'area'),
            ('Wetland - Lowland raised bog', 'Wetland', 'Very High', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Fen Bank', 'Lichfield', 'Arden');
         INSERT INTO Stock VALUES
            ('B1', 'Wetland - Fens', 10.0, 0.0),
            ('B1', 'Wetland - Lowland raised bog', 10.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Wetland - Fens', 'fractional', 'local', 30000.0),
            ('B1', 'Wetland - Lowland raised bog', 'fractional', 'local', 28000.0);
         INSERT INTO TradingRules (demand_habitat, allowed_supply_habitat) VALUES
            ('Wetland - Reedbeds', 'Wetland - Fens');",
    );
    let reference = store.snapshot().unwrap();
    let site = site_in("Lichfield", "Arden");

    let demand = vec![DemandLine {
        ledger: Ledger::Area,
        habitat_name: "Wetland - Reedbeds".to_string(),
        units_required: 2.0,
        distinctiveness: Distinctiveness::High,
        broader_type: Some("Wetland".to_string()),
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    // The bog is cheaper and more distinctive, but the rule only admits fens.
    assert!(!report.allocations.is_empty());
    assert!(report
        .allocations
        .iter()
        .all(|row| row.supply_habitat == "Wetland - Fens"));
    assert!(report.shortfalls.is_empty());
    check_row_invariants(&report);
}

#[test]
fn scenario_infeasible_by_stock_reports_shortfall() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Grassland - Other neutral grassland', 'Grassland', 'Medium', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Meadow Bank', 'Lichfield', 'Arden'),
            ('B2', 'Pasture Bank', 'Lichfield', 'Arden');
         INSERT INTO Stock VALUES
            ('B1', 'Grassland - Other neutral grassland', 4.0, 0.0),
            ('B2', 'Grassland - Other neutral grassland', 2.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Grassland - Other neutral grassland', 'medium', 'local', 25000.0),
            ('B2', 'Grassland - Other neutral grassland', 'medium', 'local', 26000.0);",
    );
    let reference = store.snapshot().unwrap();
    let site = site_in("Lichfield", "Arden");

    let demand = vec![DemandLine {
        ledger: Ledger::Area,
        habitat_name: "Grassland - Other neutral grassland".to_string(),
        units_required: 10.0,
        distinctiveness: Distinctiveness::Medium,
        broader_type: Some("Grassland".to_string()),
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    let allocated: f64 = report.allocations.iter().map(|r| r.units_supplied).sum();
    assert!((allocated - 6.0).abs() < 1e-6);
    assert_eq!(report.shortfalls.len(), 1);
    assert!((report.shortfalls[0].units_unmet - 4.0).abs() < 1e-6);
    check_row_invariants(&report);

    // Stock limits are honoured per bank.
    for row in &report.allocations {
        match row.bank_id.as_str() {
            "B1" => assert!(row.stock_units_consumed <= 4.0 + 1e-9),
            "B2" => assert!(row.stock_units_consumed <= 2.0 + 1e-9),
            other => panic!("unexpected bank {other}"),
        }
    }
}

#[test]
fn scenario_tiny_demand_rounds_up_once() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Grassland - Other neutral grassland', 'Grassland', 'Medium', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Meadow Bank', 'Lichfield', 'Arden');
         INSERT INTO Stock VALUES ('B1', 'Grassland - Other neutral grassland', 10.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Grassland - Other neutral grassland', 'fractional', 'local', 25000.0);",
    );
    let reference = store.snapshot().unwrap();
    let site = site_in("Lichfield", "Arden");

    let demand = vec![DemandLine {
        ledger: Ledger::Area,
        habitat_name: "Grassland - Other neutral grassland".to_string(),
        units_required: 0.001,
        distinctiveness: Distinctiveness::Medium,
        broader_type: Some("Grassland".to_string()),
    }];

    let report = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);

    assert_eq!(report.allocations.len(), 1);
    let row = &report.allocations[0];
    assert!((row.units_supplied - 0.01).abs() < 1e-12);
    assert!((row.cost - 250.0).abs() < 1e-9);
}

#[test]
fn lp_and_greedy_agree_on_small_instances() {
    let store = seeded_store(
        "INSERT INTO HabitatCatalog VALUES
            ('Grassland - Other neutral grassland', 'Grassland', 'Medium', 'area'),
            ('Grassland - Traditional meadow', 'Grassland', 'Medium', 'area');
         INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
            ('B1', 'Meadow Bank', 'Lichfield', 'Arden'),
            ('B2', 'Pasture Bank', 'Lichfield', 'Arden');
         INSERT INTO Stock VALUES
            ('B1', 'Grassland - Other neutral grassland', 50.0, 0.0),
            ('B2', 'Grassland - Other neutral grassland', 50.0, 0.0),
            ('B2', 'Grassland - Traditional meadow', 50.0, 0.0);
         INSERT INTO Pricing VALUES
            ('B1', 'Grassland - Other neutral grassland', 'small', 'local', 21000.0),
            ('B2', 'Grassland - Other neutral grassland', 'small', 'local', 24000.0),
            ('B2', 'Grassland - Traditional meadow', 'small', 'local', 19000.0);",
    );
    let reference = store.snapshot().unwrap();
    let site = site_in("Lichfield", "Arden");

    let demand = vec![
        DemandLine {
            ledger: Ledger::Area,
            habitat_name: "Grassland - Other neutral grassland".to_string(),
            units_required: 2.0,
            distinctiveness: Distinctiveness::Medium,
            broader_type: Some("Grassland".to_string()),
        },
        DemandLine {
            ledger: Ledger::Area,
            habitat_name: "Grassland - Traditional meadow".to_string(),
            units_required: 1.5,
            distinctiveness: Distinctiveness::Medium,
            broader_type: Some("Grassland".to_string()),
        },
    ];

    let lp = AllocationEngine::new(&reference, &site, EngineSettings::default()).run(&demand);
    let greedy = AllocationEngine::new(
        &reference,
        &site,
        EngineSettings {
            solver: SolverSelection::GreedyOnly,
            ..Default::default()
        },
    )
    .run(&demand);

    // Feasible, uncontended instance: the greedy oracle matches the LP.
    assert!((lp.total_cost - greedy.total_cost).abs() < 1e-6);
    assert_eq!(lp.allocations.len(), greedy.allocations.len());
    assert!(lp.shortfalls.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_cache_hit_skips_rework() {
    let store = ReferenceStore::in_memory().unwrap();
    store
        .with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO DistinctivenessLevels VALUES
                    ('Very Low', 0), ('Low', 1), ('Medium', 2), ('High', 3), ('Very High', 4);
                 INSERT INTO HabitatCatalog VALUES
                    ('Grassland - Other neutral grassland', 'Grassland', 'Medium', 'area');
                 INSERT INTO Banks (bank_id, bank_name, lpa_name, nca_name) VALUES
                    ('B1', 'Meadow Bank', 'Lichfield', 'Arden');
                 INSERT INTO Stock VALUES ('B1', 'Grassland - Other neutral grassland', 10.0, 0.0);
                 INSERT INTO Pricing VALUES
                    ('B1', 'Grassland - Other neutral grassland', 'fractional', 'local', 25000.0);",
            )
        })
        .unwrap();

    // Unroutable geography endpoints: the resolver degrades to empty
    // neighbour sets, which is all this local scenario needs.
    let config = Config {
        database_path: ":memory:".to_string(),
        port: 0,
        worker_count: 1,
        job_timeout_secs: 30,
        result_cache_ttl_secs: 12 * 3600,
        reference_ttl_secs: 600,
        neighbour_cache_ttl_secs: 3600,
        geocode_cache_ttl_secs: 3600,
        contract_size_thresholds: [1.0, 5.0, 15.0],
        solver: SolverSelection::LpFirst,
        postcode_api_base: "http://127.0.0.1:1".to_string(),
        geocoder_api_base: "http://127.0.0.1:1".to_string(),
        lpa_layer_base: "http://127.0.0.1:1".to_string(),
        nca_layer_base: "http://127.0.0.1:1".to_string(),
        catchment_api_base: "http://127.0.0.1:1".to_string(),
    };

    let service = JobService::start(
        Arc::new(ResultCache::in_memory(12 * 3600).unwrap()),
        Arc::new(store),
        Arc::new(GeographyResolver::new(&config).unwrap()),
        EngineSettings::default(),
        Duration::from_secs(30),
        1,
    );

    let inputs = JobInputs {
        demand: vec![DemandSpec {
            habitat: "Grassland - Other neutral grassland".to_string(),
            units: 0.5,
            ledger: Some(Ledger::Area),
            distinctiveness: None,
            broader_type: None,
        }],
        site: SiteInput {
            lpa: Some("Lichfield".to_string()),
            nca: Some("Arden".to_string()),
            ..Default::default()
        },
        metric_file: None,
        options: Default::default(),
    };

    let first = service.submit(inputs.clone()).unwrap();
    assert!(!first.cached);

    let first_record = loop {
        let record = service.status(first.job_id).unwrap();
        if record.state.is_terminal() {
            break record;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    let first_result = first_record.result.expect("first job result");

    // Identical submission: answered from cache, already done, same payload.
    let second = service.submit(inputs).unwrap();
    assert!(second.cached);
    assert_eq!(second.fingerprint, first.fingerprint);

    let second_record = service.status(second.job_id).unwrap();
    assert_eq!(second_record.state.as_str(), "done");
    let second_result = second_record.result.expect("cached result");
    assert_eq!(first_result.allocations, second_result.allocations);
    assert_eq!(first_result.total_cost, second_result.total_cost);
}
