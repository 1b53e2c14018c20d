//! Remote configuration stages of the energy measurement campaign.
mod settings;
pub use settings::{StageSettings, WorkloadSettings};

mod util;

pub mod system;
pub use system::{SharedMount, SystemUpdate};

pub mod kube;
pub use kube::{EnergyExporter, EnergyScheduler, PodCpuBurn, SocialNetwork};

pub mod load;
pub use load::{HostCpuBurn, LoadGenerator, Workload};

pub mod pods;
pub use pods::{Disruption, running_pods};

mod catalogue;
pub use catalogue::register_builtin_stages;
