//! Offer/answer cycle
//!
//! One cycle:
//! 1. create a transport, its default data channel and a local offer
//! 2. register the offer, passing the clients already connected
//! 3. answer every remote offer bundled in the registration, in parallel,
//!    and submit the answers as one batch
//! 4. poll for the answer to our own offer and apply it
//!
//! Connecting is left to the transport; the dispatcher promotes the record
//! once it reports `Connected`.

use crate::connection::ConnectionRecord;
use crate::context::MeshContext;
use crate::signaling::{AnswerInfo, AnswerSubmission, OfferInfo};
use crate::transport::SessionDescription;
use crate::types::{Origin, TransportState};
use crate::{Error, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Run one offer cycle
///
/// Returns the self-initiated record once the remote answer has been applied.
/// On any error the record is released before returning.
#[instrument(skip(ctx), fields(role = %ctx.config.role))]
pub(crate) async fn run_cycle(ctx: &Arc<MeshContext>) -> Result<Arc<ConnectionRecord>> {
    let record = ctx.open_connection(Origin::Initiator).await?;

    match offer_and_wait(ctx, &record).await {
        Ok(()) => Ok(record),
        Err(e) => {
            debug!(correlation_id = %record.correlation_id(), "Offer cycle aborted: {}", e);
            ctx.discard(&record).await;
            Err(e)
        }
    }
}

async fn offer_and_wait(ctx: &Arc<MeshContext>, record: &Arc<ConnectionRecord>) -> Result<()> {
    let transport = record.transport();
    let negotiation = &ctx.config.negotiation;

    let channel = transport
        .create_data_channel(&negotiation.default_channel_label)
        .await?;
    record.insert_channel(channel, false);

    let offer = transport.create_offer().await?;
    transport.set_local_description(offer).await?;
    let offer = transport
        .local_description()
        .await
        .ok_or_else(|| Error::SdpError("Local offer missing after it was applied".to_string()))?;
    record.apply_state(TransportState::Negotiating);

    let established = ctx.pool.established_client_ids();
    let registration = ctx
        .cancellable(
            ctx.signaling
                .register_offer(ctx.config.role, &offer.sdp, &established),
        )
        .await?;

    let sdp_id = registration.registered_offer.sdp_id;
    record.set_sdp_id(sdp_id);
    info!(
        sdp_id = %sdp_id,
        established = established.len(),
        received = registration.received_offer_array.len(),
        "Offer registered"
    );

    answer_remote_offers(ctx, registration.received_offer_array).await?;

    let answer = poll_for_answer(ctx, sdp_id).await?;
    info!(
        sdp_id = %sdp_id,
        client_id = %answer.answer_client_id,
        "Answer received"
    );
    record.set_client_id(answer.answer_client_id);
    transport
        .set_remote_description(SessionDescription::answer(answer.answer))
        .await?;

    Ok(())
}

/// Answer every remote offer in parallel and submit one batch
///
/// A responder that fails is released and left out of the batch; the others
/// are unaffected. Nothing is submitted if every responder failed.
async fn answer_remote_offers(ctx: &Arc<MeshContext>, offers: Vec<OfferInfo>) -> Result<()> {
    if offers.is_empty() {
        return Ok(());
    }

    let handles: Vec<_> = offers
        .into_iter()
        .map(|offer| {
            let ctx = Arc::clone(ctx);
            ctx.tracker.clone().spawn(async move {
                let sdp_id = offer.sdp_id;
                (sdp_id, answer_offer(&ctx, offer).await)
            })
        })
        .collect();

    let mut answers = Vec::with_capacity(handles.len());
    let mut responders = Vec::with_capacity(handles.len());
    for joined in join_all(handles).await {
        match joined {
            Ok((_, Ok((answer, record)))) => {
                answers.push(answer);
                responders.push(record);
            }
            Ok((sdp_id, Err(e))) => {
                warn!(sdp_id = %sdp_id, "Failed to answer remote offer: {}", e);
            }
            Err(e) => {
                warn!("Responder task failed: {}", e);
            }
        }
    }

    if answers.is_empty() {
        warn!("No remote offer could be answered");
        return Ok(());
    }

    if let Err(e) = ctx.cancellable(ctx.signaling.register_answers(&answers)).await {
        for record in &responders {
            ctx.discard(record).await;
        }
        return Err(e);
    }

    info!(count = answers.len(), "Answers registered");
    Ok(())
}

async fn answer_offer(
    ctx: &Arc<MeshContext>,
    offer: OfferInfo,
) -> Result<(AnswerSubmission, Arc<ConnectionRecord>)> {
    let remote_sdp = offer.offer_sdp()?;
    let record = ctx.open_connection(Origin::Responder).await?;
    record.set_sdp_id(offer.sdp_id);
    record.set_client_id(offer.offer_client_id);

    match build_answer(&record, remote_sdp).await {
        Ok(answer) => {
            debug!(
                sdp_id = %offer.sdp_id,
                client_id = %offer.offer_client_id,
                "Answer created"
            );
            Ok((
                AnswerSubmission {
                    sdp_id: offer.sdp_id,
                    answer,
                },
                record,
            ))
        }
        Err(e) => {
            ctx.discard(&record).await;
            Err(e)
        }
    }
}

async fn build_answer(record: &ConnectionRecord, remote_sdp: String) -> Result<String> {
    let transport = record.transport();
    record.apply_state(TransportState::Negotiating);

    transport
        .set_remote_description(SessionDescription::offer(remote_sdp))
        .await?;
    let answer = transport.create_answer().await?;
    transport.set_local_description(answer).await?;

    transport
        .local_description()
        .await
        .map(|description| description.sdp)
        .ok_or_else(|| Error::SdpError("Local answer missing after it was applied".to_string()))
}

/// Poll until an answer arrives, at most once per poll interval
async fn poll_for_answer(ctx: &MeshContext, sdp_id: Uuid) -> Result<AnswerInfo> {
    let interval = ctx.config.negotiation.poll_interval();
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        if let Some(answer) = ctx.cancellable(ctx.signaling.poll_answer(sdp_id)).await? {
            debug!(sdp_id = %sdp_id, polls, "Answer available");
            return Ok(answer);
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Error::ShuttingDown),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
