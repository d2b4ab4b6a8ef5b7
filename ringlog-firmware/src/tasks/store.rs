//! Storage task
//!
//! Owns the storage manager. Alternates between servicing the flash (each
//! serviced request is one completion for the manager) and polling the
//! manager; when nothing can progress it sleeps until a request arrives or
//! the next tick.

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_futures::yield_now;

use ringlog_core::{StageError, StorageManager};
use ringlog_hal_rp2040::Rp2040Flash;

use crate::channels::{StoreRequest, STORE_REQUESTS};
use crate::tasks::tick::TICK_SIGNAL;

pub type Store = StorageManager<Rp2040Flash<'static>>;

/// Storage task - drives log writes and config saves
#[embassy_executor::task]
pub async fn store_task(mut store: Store) {
    info!("Store task started");

    let mut now_ms = 0u32;
    let mut saving = false;
    // Request whose staging slot was still occupied
    let mut deferred: Option<StoreRequest> = None;

    loop {
        if let Some(ok) = store.flash_mut().service() {
            store.completion_notify(ok);
        }

        if let Some(request) = deferred.take() {
            deferred = submit(&mut store, request);
        }

        let more = store.poll(now_ms);

        if saving && store.is_config_saved() {
            saving = false;
            info!("Configuration {} saved", store.config().sequence());
        }

        if more || deferred.is_some() || store.flash().is_pending() {
            yield_now().await;
            continue;
        }

        match select(STORE_REQUESTS.receive(), TICK_SIGNAL.wait()).await {
            Either::First(request) => {
                saving |= matches!(request, StoreRequest::SaveConfig { .. });
                deferred = submit(&mut store, request);
            }
            Either::Second(now) => now_ms = now,
        }
    }
}

/// Hand `request` to the manager, returning it if it has to wait
fn submit(store: &mut Store, request: StoreRequest) -> Option<StoreRequest> {
    let result = match request {
        StoreRequest::SaveConfig { force } => {
            store.save_config(force);
            Ok(())
        }
        StoreRequest::UpdateHeader(header) => store.store_update_header(header),
        StoreRequest::UpdateChunk(chunk) => store.store_update_chunk(chunk),
        StoreRequest::UpdateExecute(execute) => store.store_update_execute(execute),
    };

    match result {
        Ok(()) => None,
        Err(StageError::Busy) => Some(request),
        Err(e) => {
            warn!("Store request {} rejected: {}", request, e);
            None
        }
    }
}
