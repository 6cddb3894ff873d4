//! The world: arenas for every entity class plus the aggregate subsystems.
//!
//! Entities reference each other by arena key, never by owning pointer;
//! completed entities are removed from their arena (or flagged done) rather
//! than dropped through reference cycles.

use slotmap::SlotMap;

use crate::agv::Agv;
use crate::cell::PickingCell;
use crate::controllers::stores::StockLedger;
use crate::controllers::system::SystemState;
use crate::errors::SimError;
use crate::jobs::Job;
use crate::kernel::Scheduler;
use crate::operations::FeedingOperation;
use crate::products::Product;
use crate::psp::PreShopPool;
use crate::requests::{LayerRequest, PalletRequest, ProductRequest};
use crate::server::Server;
use crate::shopfloor::ShopFloor;
use crate::types::{
    AgvId, CellId, FoId, JobId, Location, LocationId, PalletRequestId, ProductId, ServerId,
    StoreId, UnitLoadId,
};
use crate::unitload::UnitLoad;
use crate::warehouse::WarehouseStore;

pub struct World {
    pub products: SlotMap<ProductId, Product>,
    pub locations: SlotMap<LocationId, Location>,
    pub unit_loads: SlotMap<UnitLoadId, UnitLoad>,
    pub pallet_requests: SlotMap<PalletRequestId, PalletRequest>,
    pub jobs: SlotMap<JobId, Job>,
    pub servers: SlotMap<ServerId, Server>,
    pub stores: SlotMap<StoreId, WarehouseStore>,
    pub cells: SlotMap<CellId, PickingCell>,
    pub agvs: SlotMap<AgvId, Agv>,
    pub feeding_ops: SlotMap<FoId, FeedingOperation>,

    pub shopfloor: ShopFloor,
    pub psp: PreShopPool,
    pub system: SystemState,
    pub stock: StockLedger,

    pub next_product_request_id: u64,
    pub next_pallet_request_id: u64,
    pub next_fo_seq: u64,
}

impl World {
    pub fn new(sched: &mut Scheduler) -> Self {
        let mut locations = SlotMap::with_key();
        let input = locations.insert(Location::new("system input", 0, 0));
        let output = locations.insert(Location::new("system output", 0, 0));
        let recharge = locations.insert(Location::new("agv recharge", 0, 0));
        Self {
            products: SlotMap::with_key(),
            locations,
            unit_loads: SlotMap::with_key(),
            pallet_requests: SlotMap::with_key(),
            jobs: SlotMap::with_key(),
            servers: SlotMap::with_key(),
            stores: SlotMap::with_key(),
            cells: SlotMap::with_key(),
            agvs: SlotMap::with_key(),
            feeding_ops: SlotMap::with_key(),
            shopfloor: ShopFloor::new(sched),
            psp: PreShopPool::new(sched),
            system: SystemState::new(input, output, recharge),
            stock: StockLedger::default(),
            next_product_request_id: 0,
            next_pallet_request_id: 0,
            next_fo_seq: 0,
        }
    }

    pub fn add_location(&mut self, name: impl Into<String>, x: i64, y: i64) -> LocationId {
        self.locations.insert(Location::new(name, x, y))
    }

    pub fn add_product(&mut self, product: Product) -> ProductId {
        self.products.insert(product)
    }

    pub fn add_server(&mut self, server: Server) -> ServerId {
        self.servers.insert(server)
    }

    pub fn add_store(&mut self, store: WarehouseStore) -> StoreId {
        self.stores.insert(store)
    }

    pub fn add_cell(&mut self, cell: PickingCell) -> CellId {
        self.cells.insert(cell)
    }

    pub fn add_agv(&mut self, agv: Agv) -> AgvId {
        self.agvs.insert(agv)
    }

    pub fn add_job(&mut self, job: Job) -> JobId {
        self.jobs.insert(job)
    }

    fn next_product_request_id(&mut self) -> u64 {
        let id = self.next_product_request_id;
        self.next_product_request_id += 1;
        id
    }

    /// Build a pallet request from layer specs: one inner vec per layer,
    /// each `(product, n_cases)` entry one product request. Owns a fresh
    /// empty unit load.
    pub fn build_pallet_request(
        &mut self,
        layers: &[Vec<(ProductId, u32)>],
    ) -> Result<PalletRequestId, SimError> {
        let mut layer_requests = Vec::with_capacity(layers.len());
        for layer in layers {
            let mut product_requests = Vec::with_capacity(layer.len());
            for &(product, n_cases) in layer {
                let id = self.next_product_request_id();
                let spec = self
                    .products
                    .get(product)
                    .ok_or_else(|| SimError::InvalidRequest("unknown product".into()))?;
                product_requests.push(ProductRequest::new(id, product, spec, n_cases)?);
            }
            layer_requests.push(LayerRequest::new(product_requests, &self.products)?);
        }
        let unit_load = self.unit_loads.insert(UnitLoad::empty());
        let id = self.next_pallet_request_id;
        self.next_pallet_request_id += 1;
        let pallet_request = PalletRequest::new(id, layer_requests, unit_load)?;
        Ok(self.pallet_requests.insert(pallet_request))
    }

    /// Seed a store location with a full pallet of `product`, updating the
    /// ledger. Returns the created unit load.
    pub fn warmup_location(
        &mut self,
        store: StoreId,
        location: usize,
        product: ProductId,
    ) -> Result<UnitLoadId, SimError> {
        let spec = self
            .products
            .get(product)
            .cloned()
            .ok_or_else(|| SimError::InvalidRequest("unknown product".into()))?;
        let unit_load = self.unit_loads.insert(UnitLoad::full_of(product, &spec));
        self.stores[store].locations[location].put(unit_load, &self.unit_loads)?;
        self.stock.add_on_hand(product, i64::from(spec.case_per_pallet()));
        Ok(unit_load)
    }
}
