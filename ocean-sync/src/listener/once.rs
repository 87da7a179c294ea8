//! One resync, then stop.

use crate::error::SyncResult;
use crate::integration::Integration;
use crate::state::ResyncReport;

pub async fn run(integration: &Integration) -> SyncResult<ResyncReport> {
    integration.trigger_resync().wait().await
}
