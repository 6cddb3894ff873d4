//! Automated guided vehicles.
//!
//! An AGV is a capacity-1 priority resource with a finite-state status, a
//! trip log and a mission log. A mission spans one semaphore grant; a trip
//! is one movement between locations at the AGV's speed.
//!
//! An AGV's time splits into travel, waiting (both inside a mission) and
//! idle time (no mission assigned).

use crate::errors::SimError;
use crate::resources::{PrioritySemaphore, RequestId};
use crate::types::{CellId, FoId, LocationId, SimTime, UnitLoadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgvKind {
    /// Feeds picking cells from the stores.
    Feeding,
    /// Brings fresh pallets into the stores.
    Replenishment,
    /// Carries inbound material into the system.
    Input,
    /// Carries finished pallets out of the system.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgvStatus {
    Idle,
    Recharging,
    TravelingUnloaded,
    TravelingLoaded,
    WaitingToBeLoaded,
    WaitingToBeUnloaded,
}

impl AgvStatus {
    pub fn name(self) -> &'static str {
        match self {
            AgvStatus::Idle => "IDLE",
            AgvStatus::Recharging => "RECHARGING",
            AgvStatus::TravelingUnloaded => "TRAVELING_UNLOADED",
            AgvStatus::TravelingLoaded => "TRAVELING_LOADED",
            AgvStatus::WaitingToBeLoaded => "WAITING_TO_BE_LOADED",
            AgvStatus::WaitingToBeUnloaded => "WAITING_TO_BE_UNLOADED",
        }
    }
}

/// One movement between two locations.
#[derive(Debug, Clone)]
pub struct Trip {
    pub start_location: LocationId,
    pub end_location: LocationId,
    pub start_time: SimTime,
    pub duration: f64,
    pub end_time: SimTime,
    pub distance: f64,
    pub loaded: bool,
}

/// One semaphore grant, from request to release.
#[derive(Debug, Clone)]
pub struct Mission {
    pub request: RequestId,
    pub operation: Option<FoId>,
    pub started_at: Option<SimTime>,
    pub ended_at: Option<SimTime>,
}

impl Mission {
    pub fn duration(&self) -> Option<f64> {
        Some(self.ended_at? - self.started_at?)
    }
}

pub struct Agv {
    pub sem: PrioritySemaphore,
    pub kind: AgvKind,
    pub load_timeout: f64,
    pub unload_timeout: f64,
    pub speed: f64,
    /// The cell this AGV is dedicated to, for feeding vehicles.
    pub picking_cell: Option<CellId>,

    status: AgvStatus,
    unit_load: Option<UnitLoadId>,
    pub current_location: LocationId,

    pub trips: Vec<Trip>,
    pending_trip: Option<Trip>,
    pub missions: Vec<Mission>,
    current_mission: Option<usize>,
    pub travel_time: f64,
    pub travel_distance: f64,

    loading_wait_start: Option<SimTime>,
    pub loading_waiting_times: Vec<f64>,
}

impl Agv {
    pub fn new(
        kind: AgvKind,
        load_timeout: f64,
        unload_timeout: f64,
        speed: f64,
        home: LocationId,
    ) -> Self {
        assert!(speed > 0.0, "AGV speed must be positive");
        Self {
            sem: PrioritySemaphore::new(1),
            kind,
            load_timeout,
            unload_timeout,
            speed,
            picking_cell: None,
            status: AgvStatus::Idle,
            unit_load: None,
            current_location: home,
            trips: Vec::new(),
            pending_trip: None,
            missions: Vec::new(),
            current_mission: None,
            travel_time: 0.0,
            travel_distance: 0.0,
            loading_wait_start: None,
            loading_waiting_times: Vec::new(),
        }
    }

    pub fn status(&self) -> AgvStatus {
        self.status
    }

    pub fn unit_load(&self) -> Option<UnitLoadId> {
        self.unit_load
    }

    /// Status setter with the domain contracts: waiting-to-be-loaded
    /// requires an empty deck and opens the loading-wait window;
    /// waiting-to-be-unloaded requires a load and closes the window.
    pub fn set_status(&mut self, status: AgvStatus, now: SimTime) -> Result<(), SimError> {
        match status {
            AgvStatus::WaitingToBeLoaded => {
                if self.unit_load.is_some() {
                    return Err(self.transition_error(status, now));
                }
                self.loading_wait_start = Some(now);
            }
            AgvStatus::WaitingToBeUnloaded => {
                if self.unit_load.is_none() {
                    return Err(self.transition_error(status, now));
                }
                if let Some(started) = self.loading_wait_start.take() {
                    self.loading_waiting_times.push(now - started);
                }
            }
            _ => {}
        }
        self.status = status;
        Ok(())
    }

    fn transition_error(&self, attempted: AgvStatus, now: SimTime) -> SimError {
        SimError::WrongStatusTransition {
            agv: 0,
            from: self.status.name(),
            attempted: attempted.name(),
            at: now,
        }
    }

    /// Put a unit load on board. At most one at a time, and only while
    /// waiting to be loaded.
    pub fn load(&mut self, unit_load: UnitLoadId, now: SimTime) -> Result<(), SimError> {
        if self.status != AgvStatus::WaitingToBeLoaded {
            return Err(self.transition_error(AgvStatus::WaitingToBeLoaded, now));
        }
        if self.unit_load.is_some() {
            return Err(self.transition_error(AgvStatus::WaitingToBeLoaded, now));
        }
        self.unit_load = Some(unit_load);
        Ok(())
    }

    /// Take the unit load off board.
    pub fn unload(&mut self, now: SimTime) -> Result<UnitLoadId, SimError> {
        let Some(unit_load) = self.unit_load.take() else {
            return Err(self.transition_error(AgvStatus::WaitingToBeUnloaded, now));
        };
        Ok(unit_load)
    }

    // --- Trips ---------------------------------------------------------------

    /// Start a trip to `destination`; returns its duration. The caller
    /// yields a timeout for the duration, then calls [`Agv::finish_trip`].
    pub fn begin_trip(
        &mut self,
        destination: LocationId,
        distance: f64,
        now: SimTime,
    ) -> Result<f64, SimError> {
        let loaded = self.unit_load.is_some();
        let status =
            if loaded { AgvStatus::TravelingLoaded } else { AgvStatus::TravelingUnloaded };
        self.set_status(status, now)?;
        let duration = distance / self.speed;
        self.pending_trip = Some(Trip {
            start_location: self.current_location,
            end_location: destination,
            start_time: now,
            duration,
            end_time: now + duration,
            distance,
            loaded,
        });
        Ok(duration)
    }

    /// Close the pending trip: update position, travel time and distance.
    pub fn finish_trip(&mut self, now: SimTime) {
        let Some(trip) = self.pending_trip.take() else {
            return;
        };
        debug_assert!(now >= trip.end_time - 1e-9, "trip finished early");
        self.current_location = trip.end_location;
        self.travel_time += trip.duration;
        self.travel_distance += trip.distance;
        self.trips.push(trip);
    }

    // --- Missions ------------------------------------------------------------

    /// Open a mission record alongside a semaphore request.
    pub fn note_mission_requested(&mut self, request: RequestId, operation: Option<FoId>) {
        self.missions.push(Mission { request, operation, started_at: None, ended_at: None });
    }

    /// Mark the mission of `request` as started (the grant fired).
    pub fn begin_mission(&mut self, request: RequestId, now: SimTime) {
        if let Some(idx) = self.missions.iter().position(|m| m.request == request) {
            self.missions[idx].started_at = Some(now);
            self.current_mission = Some(idx);
        }
    }

    /// Close the current mission and go idle. The semaphore release itself
    /// is done by the caller, which owns the request id.
    pub fn end_mission(&mut self, now: SimTime) {
        if let Some(idx) = self.current_mission.take() {
            self.missions[idx].ended_at = Some(now);
        }
        self.status = AgvStatus::Idle;
    }

    pub fn current_mission(&self) -> Option<&Mission> {
        self.current_mission.map(|idx| &self.missions[idx])
    }

    pub fn total_mission_duration(&self) -> f64 {
        self.missions.iter().filter_map(Mission::duration).sum()
    }

    /// Time spent without any mission assigned.
    pub fn idle_time(&self, now: SimTime) -> f64 {
        now - self.total_mission_duration()
    }

    pub fn saturation(&self, now: SimTime) -> f64 {
        if now <= 0.0 { 0.0 } else { self.total_mission_duration() / now }
    }

    /// Waiting inside missions: mission time that is not travel.
    pub fn waiting_time(&self) -> f64 {
        self.total_mission_duration() - self.travel_time
    }

    /// Open missions plus queued requests; the dispatch policy prefers the
    /// least busy vehicle.
    pub fn pending_work(&self) -> usize {
        self.sem.count() + self.sem.queue_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use crate::types::Location;

    fn locations() -> (SlotMap<LocationId, Location>, Vec<LocationId>) {
        let mut arena = SlotMap::with_key();
        let a = arena.insert(Location::new("a", 0, 0));
        let b = arena.insert(Location::new("b", 12, 0));
        (arena, vec![a, b])
    }

    fn unit_load_id() -> UnitLoadId {
        let mut arena: SlotMap<UnitLoadId, ()> = SlotMap::with_key();
        arena.insert(())
    }

    #[test]
    fn cannot_wait_to_be_loaded_while_loaded() {
        let (_, locs) = locations();
        let mut agv = Agv::new(AgvKind::Feeding, 2.0, 2.0, 1.5, locs[0]);
        agv.set_status(AgvStatus::WaitingToBeLoaded, 0.0).unwrap();
        agv.load(unit_load_id(), 1.0).unwrap();
        let err = agv.set_status(AgvStatus::WaitingToBeLoaded, 2.0).unwrap_err();
        assert!(matches!(err, SimError::WrongStatusTransition { .. }));
    }

    #[test]
    fn cannot_carry_two_unit_loads() {
        let (_, locs) = locations();
        let mut agv = Agv::new(AgvKind::Feeding, 2.0, 2.0, 1.5, locs[0]);
        agv.set_status(AgvStatus::WaitingToBeLoaded, 0.0).unwrap();
        agv.load(unit_load_id(), 0.0).unwrap();
        assert!(agv.load(unit_load_id(), 0.0).is_err());
    }

    #[test]
    fn waiting_to_be_unloaded_closes_the_loading_window() {
        let (_, locs) = locations();
        let mut agv = Agv::new(AgvKind::Feeding, 2.0, 2.0, 1.5, locs[0]);
        agv.set_status(AgvStatus::WaitingToBeLoaded, 10.0).unwrap();
        agv.load(unit_load_id(), 12.0).unwrap();
        agv.set_status(AgvStatus::WaitingToBeUnloaded, 15.0).unwrap();
        assert_eq!(agv.loading_waiting_times, vec![5.0]);
    }

    #[test]
    fn unload_without_load_is_refused() {
        let (_, locs) = locations();
        let mut agv = Agv::new(AgvKind::Output, 2.0, 2.0, 1.5, locs[0]);
        assert!(agv.unload(0.0).is_err());
    }

    #[test]
    fn trips_update_position_and_travel_tallies() {
        let (_, locs) = locations();
        let mut agv = Agv::new(AgvKind::Feeding, 2.0, 2.0, 2.0, locs[0]);
        let duration = agv.begin_trip(locs[1], 12.0, 0.0).unwrap();
        assert_eq!(duration, 6.0);
        assert_eq!(agv.status(), AgvStatus::TravelingUnloaded);
        agv.finish_trip(6.0);
        assert_eq!(agv.current_location, locs[1]);
        assert_eq!(agv.travel_time, 6.0);
        assert_eq!(agv.travel_distance, 12.0);
        assert_eq!(agv.trips.len(), 1);
    }
}
