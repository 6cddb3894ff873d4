//! Persistent snapshots and mission export.
//!
//! Snapshots capture the state a replay viewer needs; trip records export
//! the AGV movement history row by row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sim::Sim;
use crate::types::{JobId, RawKey, SimTime};
use crate::world::World;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: u64,
    pub queue_length: usize,
    pub processing_job_id: Option<u64>,
    pub utilization: f64,
    pub wip: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobLocation {
    Psp,
    Queue,
    Processing,
    Transit,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: u64,
    pub family: String,
    pub location: JobLocation,
    pub server_id: Option<u64>,
    pub queue_position: Option<usize>,
    /// 0 = comfortable, 1 = due now or overdue.
    pub urgency: f64,
    pub due_date: SimTime,
    pub created_at: SimTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub sim_time: SimTime,
    pub servers: Vec<ServerEntry>,
    pub jobs: Vec<JobEntry>,
    pub psp_jobs: Vec<u64>,
    pub wip_total: f64,
    pub wip_per_server: BTreeMap<u64, f64>,
    pub jobs_completed: usize,
}

fn urgency(due_date: SimTime, created_at: SimTime, now: SimTime) -> f64 {
    if now >= due_date {
        return 1.0;
    }
    let horizon = due_date - created_at;
    if horizon <= 0.0 {
        return 1.0;
    }
    (1.0 - (due_date - now) / horizon).clamp(0.0, 1.0)
}

fn locate_job(world: &World, job_id: JobId) -> (JobLocation, Option<u64>, Option<usize>) {
    let job = &world.jobs[job_id];
    if job.done {
        return (JobLocation::Completed, None, None);
    }
    if world.psp.contains(job_id) {
        return (JobLocation::Psp, None, None);
    }
    let raw = job_id.to_raw();
    for (server_id, server) in world.servers.iter() {
        if server.sem.users().iter().any(|grant| grant.tag == raw) {
            return (JobLocation::Processing, Some(server_id.to_raw()), None);
        }
        if let Some(position) = server.sem.queued_tags().position(|tag| tag == raw) {
            return (JobLocation::Queue, Some(server_id.to_raw()), Some(position));
        }
    }
    (JobLocation::Transit, None, None)
}

/// Capture the replay snapshot of the current state.
pub fn capture(sim: &Sim) -> SystemSnapshot {
    let now = sim.sched.now();
    let world = &sim.world;

    let servers = world
        .servers
        .iter()
        .map(|(id, server)| ServerEntry {
            id: id.to_raw(),
            queue_length: server.queue_len(),
            processing_job_id: server.sem.users().first().map(|grant| grant.tag),
            utilization: server.utilization_rate(now),
            wip: world.shopfloor.wip.get(id).copied().unwrap_or(0.0),
        })
        .collect();

    let jobs = world
        .jobs
        .iter()
        .map(|(id, job)| {
            let (location, server_id, queue_position) = locate_job(world, id);
            JobEntry {
                id: id.to_raw(),
                family: job.family.clone(),
                location,
                server_id,
                queue_position,
                urgency: urgency(job.due_date, job.created_at, now),
                due_date: job.due_date,
                created_at: job.created_at,
            }
        })
        .collect();

    SystemSnapshot {
        sim_time: now,
        servers,
        jobs,
        psp_jobs: world.psp.jobs().map(|job| job.to_raw()).collect(),
        wip_total: world.shopfloor.total_wip(),
        wip_per_server: world
            .shopfloor
            .wip
            .iter()
            .map(|(server, wip)| (server.to_raw(), *wip))
            .collect(),
        jobs_completed: world.shopfloor.jobs_done.len(),
    }
}

// ============================================================================
// AGV mission export
// ============================================================================

/// One row per trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRecord {
    pub agv_id: u64,
    pub start_timestamp: SimTime,
    pub start_location: String,
    pub end_timestamp: SimTime,
    pub end_location: String,
}

pub fn trip_records(world: &World) -> Vec<TripRecord> {
    let mut records = Vec::new();
    for (agv_id, agv) in world.agvs.iter() {
        for trip in &agv.trips {
            records.push(TripRecord {
                agv_id: agv_id.to_raw(),
                start_timestamp: trip.start_time,
                start_location: world
                    .locations
                    .get(trip.start_location)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                end_timestamp: trip.end_time,
                end_location: world
                    .locations
                    .get(trip.end_location)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
            });
        }
    }
    records.sort_by(|a, b| {
        a.start_timestamp.total_cmp(&b.start_timestamp).then(a.agv_id.cmp(&b.agv_id))
    });
    records
}

/// CSV rendering of the trip records, header included.
pub fn trips_to_csv(records: &[TripRecord]) -> String {
    let mut out =
        String::from("agv_id,start_timestamp,start_location,end_timestamp,end_location\n");
    for record in records {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            record.agv_id,
            record.start_timestamp,
            record.start_location,
            record.end_timestamp,
            record.end_location,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_saturates_at_the_due_date() {
        assert_eq!(urgency(10.0, 0.0, 12.0), 1.0);
        assert_eq!(urgency(10.0, 0.0, 0.0), 0.0);
        assert!((urgency(10.0, 0.0, 5.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let sim = Sim::new();
        let snapshot = capture(&sim);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"sim_time\":0"));
    }
}
