use std::time::Duration;

use log::{error, info};
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::{
        self,
        time::{self, MissedTickBehavior},
    },
    Orbit, Rocket,
};

use crate::vsp::Vsp;

/// A fairing that starts periodic fee processing once the server is running,
/// and stops it when the server shuts down.
///
/// The first pass runs immediately. Passes never overlap: a slow pass delays
/// the next one instead of queueing more.
/// This fairing depends on the [`Vsp`] being available in managed state.
pub struct FeeProcessorFairing;

#[rocket::async_trait]
impl Fairing for FeeProcessorFairing {
    fn info(&self) -> Info {
        Info {
            name: "Fee Processor",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let Some(vsp) = rocket.state::<Vsp>().cloned() else {
            error!("VSP was not available when starting fee processing");
            return;
        };
        let period = Duration::from_secs(vsp.settings().background_interval.max(1));
        let shutdown = rocket.shutdown();

        tokio::spawn(async move {
            tokio::pin!(shutdown);
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown => break,
                }
                if let Err(e) = vsp.process_fees().await {
                    error!("Fee processing pass failed: {e}");
                }
            }
            info!("Fee processing stopped");
        });
        info!("Processing fees every {}s", period.as_secs());
    }
}
