use std::sync::Arc;

use fleet_core::StageRouter;

use crate::{
    EnergyExporter, EnergyScheduler, HostCpuBurn, LoadGenerator, PodCpuBurn, SharedMount, SocialNetwork,
    StageSettings, SystemUpdate, Workload,
};

/// Register every stage of the campaign.
pub fn register_builtin_stages(router: &mut StageRouter, settings: &StageSettings) {
    router.register(Arc::new(SystemUpdate));
    router.register(Arc::new(SharedMount::new(
        settings.shared_dir.clone(),
        settings.shared_tag.clone(),
    )));
    router.register(Arc::new(EnergyExporter::new(settings)));
    router.register(Arc::new(SocialNetwork::new(settings)));
    router.register(Arc::new(EnergyScheduler::new(settings)));
    router.register(Arc::new(LoadGenerator));
    router.register(Arc::new(HostCpuBurn::new(settings)));
    router.register(Arc::new(PodCpuBurn));
    router.register(Arc::new(Workload::new(settings)));
}
