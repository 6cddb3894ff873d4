//! End-to-end jobshop scenarios with exact numeric expectations.

use slotmap::SecondaryMap;

use cellsim_core::release::ReleasePolicy;
use cellsim_core::{
    Job, LumsCor, ServerId, SimError, Slar, SlarTrigger, Until, WipStrategy, psp,
    server::Server, shopfloor, Sim,
};

// === FIXTURES ===

fn add_server(sim: &mut Sim, name: &str) -> ServerId {
    sim.world.add_server(Server::new(name, 1))
}

// === S1: single job, single server ===

#[test]
fn single_job_runs_to_completion() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    let job_id = sim.world.add_job(Job::production("a", vec![(s, 5.0)], 10.0, 0.0));

    shopfloor::add(&mut sim, job_id);
    sim.run(Until::Forever).unwrap();

    let job = &sim.world.jobs[job_id];
    assert_eq!(job.finished_at, Some(5.0));
    assert!(job.done);

    let now = sim.now();
    let server = &sim.world.servers[s];
    assert_eq!(server.worked_time, 5.0);
    assert_eq!(server.utilization_rate(now), 1.0);
    assert_eq!(server.idle_time(now), 0.0);
    assert!(sim.world.shopfloor.jobs.is_empty());
    assert_eq!(sim.world.shopfloor.jobs_done, vec![job_id]);
}

// === S2: two jobs, one server ===

#[test]
fn two_jobs_serialize_on_one_server() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    let j1 = sim.world.add_job(Job::production("a", vec![(s, 3.0)], 10.0, 0.0));
    let j2 = sim.world.add_job(Job::production("a", vec![(s, 4.0)], 10.0, 0.0));

    shopfloor::add(&mut sim, j1);
    shopfloor::add(&mut sim, j2);
    sim.run(Until::Forever).unwrap();

    assert_eq!(sim.world.jobs[j1].finished_at, Some(3.0));
    assert_eq!(sim.world.jobs[j2].finished_at, Some(7.0));
    assert_eq!(sim.world.shopfloor.jobs_done, vec![j1, j2]);

    // One job queued during [0, 3), none afterwards.
    let avg = sim.world.servers[s].average_queue_length(sim.now());
    assert!((avg - 3.0 / 7.0).abs() < 1e-9, "average queue length was {avg}");
}

// === S3: corrected WIP bookkeeping ===

#[test]
fn corrected_wip_rebalances_downstream_work() {
    let mut sim = Sim::new();
    let s1 = add_server(&mut sim, "s1");
    let s2 = add_server(&mut sim, "s2");
    let s3 = add_server(&mut sim, "s3");
    sim.world.shopfloor.set_wip_strategy(WipStrategy::Corrected);

    let j1 = sim.world.add_job(Job::production("a", vec![(s1, 2.0), (s2, 3.0)], 10.0, 0.0));
    let j2 = sim.world.add_job(Job::production("a", vec![(s2, 4.0), (s3, 5.0)], 10.0, 0.0));

    shopfloor::add(&mut sim, j1);
    shopfloor::add(&mut sim, j2);

    let wip = |sim: &Sim, s: ServerId| sim.world.shopfloor.wip.get(s).copied().unwrap_or(0.0);
    assert!((wip(&sim, s1) - 2.0).abs() < 1e-9);
    assert!((wip(&sim, s2) - 5.5).abs() < 1e-9);
    assert!((wip(&sim, s3) - 2.5).abs() < 1e-9);

    // j1 exits s1 at t=2: residual work at s2 moves one position closer.
    sim.run(Until::Time(2.0)).unwrap();
    assert!(wip(&sim, s1).abs() < 1e-9);
    assert!((wip(&sim, s2) - 7.0).abs() < 1e-9);
    assert!((wip(&sim, s3) - 2.5).abs() < 1e-9);

    // j2 exits s2 at t=4.
    sim.run(Until::Time(4.0)).unwrap();
    assert!((wip(&sim, s2) - 3.0).abs() < 1e-9);
    assert!((wip(&sim, s3) - 5.0).abs() < 1e-9);
}

// === S4: LUMS-COR release ===

#[test]
fn lumscor_releases_by_planned_release_date_within_norms() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    sim.world.shopfloor.set_wip_strategy(WipStrategy::Corrected);

    let urgent = sim.world.add_job(Job::production("a", vec![(s, 1.0)], 5.0, 0.0));
    let relaxed = sim.world.add_job(Job::production("a", vec![(s, 1.0)], 50.0, 0.0));
    // Pool them out of date order on purpose.
    psp::add(&mut sim, relaxed);
    psp::add(&mut sim, urgent);

    let mut wl_norm = SecondaryMap::new();
    wl_norm.insert(s, 100.0);
    let mut policy = LumsCor::new(wl_norm, 2.0);
    policy.release(&mut sim).unwrap();

    assert!(sim.world.psp.is_empty());
    // The due-date-5 job left the pool first.
    assert_eq!(sim.world.shopfloor.jobs, vec![urgent, relaxed]);
}

#[test]
fn lumscor_refuses_the_standard_wip_strategy() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    let job = sim.world.add_job(Job::production("a", vec![(s, 1.0)], 5.0, 0.0));
    psp::add(&mut sim, job);

    let mut policy = LumsCor::new(SecondaryMap::new(), 2.0);
    assert_eq!(policy.release(&mut sim).unwrap_err(), SimError::StrategyMismatch);
}

#[test]
fn lumscor_holds_jobs_that_overflow_the_norm() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    sim.world.shopfloor.set_wip_strategy(WipStrategy::Corrected);

    let heavy = sim.world.add_job(Job::production("a", vec![(s, 8.0)], 20.0, 0.0));
    let light = sim.world.add_job(Job::production("a", vec![(s, 1.0)], 50.0, 0.0));
    psp::add(&mut sim, heavy);
    psp::add(&mut sim, light);

    let mut wl_norm = SecondaryMap::new();
    wl_norm.insert(s, 5.0);
    let mut policy = LumsCor::new(wl_norm, 2.0);
    policy.release(&mut sim).unwrap();

    // The heavy job (considered first - earlier planned release date) does
    // not fit the norm; the light one does.
    assert!(sim.world.psp.contains(heavy));
    assert_eq!(sim.world.shopfloor.jobs, vec![light]);
}

// === S5: SLAR urgent insertion ===

#[test]
fn slar_inserts_an_urgent_job_into_a_non_urgent_queue() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");

    // One job processing plus three queued, all with comfortable slack.
    let running = sim.world.add_job(Job::production("a", vec![(s, 1.0)], 100.0, 0.0));
    shopfloor::add(&mut sim, running);
    for _ in 0..3 {
        let queued = sim.world.add_job(Job::production("a", vec![(s, 5.0)], 100.0, 0.0));
        shopfloor::add(&mut sim, queued);
    }

    // Pool an urgent job (negative planned slack) and a relaxed one.
    let urgent = sim.world.add_job(Job::production("a", vec![(s, 3.0)], 1.0, 0.0));
    let relaxed = sim.world.add_job(Job::production("a", vec![(s, 3.0)], 200.0, 0.0));
    psp::add(&mut sim, urgent);
    psp::add(&mut sim, relaxed);

    sim.sched.spawn(Box::new(SlarTrigger { slar: Slar { allowance_factor: 2.0 } }));

    // The first processing end (t=1) triggers the urgent insertion rule.
    sim.run(Until::Time(1.0)).unwrap();

    assert!(!sim.world.psp.contains(urgent));
    assert!(sim.world.psp.contains(relaxed));
    assert!(sim.world.shopfloor.jobs.contains(&urgent));
}

#[test]
fn slar_releases_on_a_starving_server() {
    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");

    let running = sim.world.add_job(Job::production("a", vec![(s, 2.0)], 100.0, 0.0));
    shopfloor::add(&mut sim, running);

    let close = sim.world.add_job(Job::production("a", vec![(s, 3.0)], 10.0, 0.0));
    let far = sim.world.add_job(Job::production("a", vec![(s, 3.0)], 90.0, 0.0));
    psp::add(&mut sim, far);
    psp::add(&mut sim, close);

    sim.sched.spawn(Box::new(SlarTrigger { slar: Slar::default() }));

    // At t=2 the queue is empty: the lowest planned slack job is released.
    sim.run(Until::Time(2.0)).unwrap();
    assert!(!sim.world.psp.contains(close));
    assert!(sim.world.psp.contains(far));
}

// === S6: warehouse location semantics ===

#[test]
fn warehouse_location_fills_inner_first_and_rejects_mismatches() {
    use cellsim_core::warehouse::{Side, WarehouseLocation};
    use cellsim_core::{Product, UnitLoad};
    use slotmap::SlotMap;

    let mut products = SlotMap::with_key();
    let spec = Product {
        probability: 1.0,
        family: "f".to_string(),
        cases_per_layer: 10,
        layers_per_pallet: 4,
        min_case_per_pallet: 60,
        max_case_per_pallet: 60,
        lp_enabled: true,
        reorder_level: 4,
    };
    let product_a = products.insert(spec.clone());
    let product_b = products.insert(spec.clone());

    let mut unit_loads = SlotMap::with_key();
    let ul_a = unit_loads.insert(UnitLoad::full_of(product_a, &spec));
    let ul_a2 = unit_loads.insert(UnitLoad::full_of(product_a, &spec));
    let ul_b = unit_loads.insert(UnitLoad::full_of(product_b, &spec));

    let mut location = WarehouseLocation::new(0, 0, Side::Left);

    location.freeze(ul_a, &unit_loads).unwrap();
    location.put(ul_a, &unit_loads).unwrap();
    assert!(location.is_half_full());
    assert!(location.first_position.free());

    location.freeze(ul_a2, &unit_loads).unwrap();
    location.put(ul_a2, &unit_loads).unwrap();
    assert!(location.is_full());

    let mut half = WarehouseLocation::new(1, 0, Side::Left);
    half.put(ul_a, &unit_loads).unwrap();
    let err = half.put(ul_b, &unit_loads).unwrap_err();
    assert!(matches!(err, SimError::IncompatibleUnitLoad { .. }));
}

// === Faulty and inspection servers ===

#[test]
fn faulty_server_repairs_and_resumes_remaining_service() {
    let mut sim = Sim::new();
    let server = Server::new("faulty", 1).faulty(
        &mut sim.sched,
        Box::new(|| 3.0),
        Box::new(|| 2.0),
    );
    let s = sim.world.add_server(server);
    let job = sim.world.add_job(Job::production("a", vec![(s, 5.0)], 50.0, 0.0));

    sim.start_breakdown_processes();
    shopfloor::add(&mut sim, job);
    sim.run(Until::Time(20.0)).unwrap();

    // Service 5, broken at t=3 (repair 2) and t=6 (repair 2): done at 9.
    assert_eq!(sim.world.jobs[job].finished_at, Some(9.0));
    let server = &sim.world.servers[s];
    assert_eq!(server.worked_time, 5.0);
    match &server.kind {
        cellsim_core::ServerKind::Faulty(state) => {
            assert_eq!(state.breakdown_time, 4.0);
            assert!(state.breakdowns >= 2);
        }
        _ => panic!("expected a faulty server"),
    }
}

#[test]
fn inspection_server_runs_the_rework_hook_once() {
    let mut sim = Sim::new();
    let server = Server::new("inspect", 1)
        .inspection(Box::new(|job: &mut Job| job.due_date += 100.0));
    let s = sim.world.add_server(server);
    let mut job = Job::production("a", vec![(s, 2.0)], 10.0, 0.0);
    job.rework = true;
    let job = sim.world.add_job(job);

    shopfloor::add(&mut sim, job);
    sim.run(Until::Forever).unwrap();

    let job = &sim.world.jobs[job];
    assert!(!job.rework);
    assert_eq!(job.due_date, 110.0);
    match &sim.world.servers[s].kind {
        cellsim_core::ServerKind::Inspection { rework_count, .. } => assert_eq!(*rework_count, 1),
        _ => panic!("expected an inspection server"),
    }
}

// === Plain starvation avoidance ===

#[test]
fn starvation_avoidance_bypasses_the_periodic_policy() {
    use cellsim_core::StarvationAvoidanceTask;

    let mut sim = Sim::new();
    let s = add_server(&mut sim, "s");
    sim.sched.spawn(Box::new(StarvationAvoidanceTask));

    let job = sim.world.add_job(Job::production("a", vec![(s, 2.0)], 10.0, 0.0));
    psp::add(&mut sim, job);

    sim.run(Until::Time(0.5)).unwrap();
    // The first server was empty: the job went straight to the shopfloor.
    assert!(!sim.world.psp.contains(job));
    assert!(sim.world.shopfloor.jobs.contains(&job));
}
