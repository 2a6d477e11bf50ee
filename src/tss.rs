// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Runs one key generation or signing session over a keep channel.
//!
//! The drivers feed a [`ProtocolParticipant`] with the protocol messages of
//! its session and broadcast whatever it produces, until it outputs or the
//! deadline passes. Handshakes happen before; see [`crate::net::ready`].

use crate::{
    errors::{InternalError, Result},
    keygen::KeygenParticipant,
    messages::Message,
    net::{BroadcastChannel, ChannelReceiver, NetMessage},
    participant::ProtocolParticipant,
    pre_params::PreParamsBox,
    protocol::{Identifier, KeepId, MemberId},
    sign::SignParticipant,
    signer::{Signature, ThresholdSigner},
};
use rand::rngs::OsRng;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

async fn broadcast(channel: &BroadcastChannel, messages: Vec<Message>) -> Result<()> {
    for message in messages {
        channel.send(&NetMessage::Protocol(message)).await?;
    }
    Ok(())
}

/// Whether `message`, received from the authenticated `sender`, belongs to
/// the session of `participant`.
fn is_relevant<P: ProtocolParticipant>(participant: &P, sender: &MemberId, message: &Message) -> bool {
    message.id() == participant.sid()
        && message.from() == sender
        && participant.other_ids().contains(sender)
        && message.is_for(participant.id())
}

/// Initialize `participant` and process incoming messages until it outputs.
///
/// `after_first_round` runs once the first round went out.
async fn drive<P, F>(
    participant: &mut P,
    channel: &BroadcastChannel,
    receiver: &mut ChannelReceiver,
    after_first_round: F,
) -> Result<P::Output>
where
    P: ProtocolParticipant,
    F: FnOnce(),
{
    let (output, messages) = participant.initialize(&mut OsRng)?.into_parts();
    broadcast(channel, messages).await?;
    after_first_round();
    if let Some(output) = output {
        return Ok(output);
    }

    loop {
        let (sender, message) = receiver
            .recv()
            .await
            .ok_or_else(|| InternalError::Transport("subscription closed".into()))?;
        let NetMessage::Protocol(message) = message else {
            continue;
        };
        if !is_relevant(participant, &sender, &message) {
            trace!("Skipping {:?} from {sender}", message.message_type());
            continue;
        }
        let (output, messages) = participant
            .process_message(&mut OsRng, &message)?
            .into_parts();
        broadcast(channel, messages).await?;
        if let Some(output) = output {
            return Ok(output);
        }
    }
}

/// Run distributed key generation among `members`, producing a signer whose
/// shares have degree `threshold`.
///
/// The pre-parameters are destroyed once the first round is on the wire;
/// a new attempt needs a new box.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(keep_id = %keep_id, sid = %sid), err(Debug))]
pub async fn generate_threshold_signer(
    keep_id: &KeepId,
    sid: Identifier,
    members: &[MemberId],
    threshold: usize,
    pre_params: &mut PreParamsBox,
    channel: &BroadcastChannel,
    receiver: &mut ChannelReceiver,
    timeout: Duration,
) -> Result<ThresholdSigner> {
    let member_id = channel.member_id().clone();
    let paillier = pre_params.content()?.decryption_key()?;
    let mut participant =
        KeygenParticipant::new(sid, member_id.clone(), members.to_vec(), threshold, paillier)?;
    debug!("Starting key generation among {} members", members.len());

    let output = tokio::time::timeout(
        timeout,
        drive(&mut participant, channel, receiver, || pre_params.destroy()),
    )
    .await
    .map_err(|_| InternalError::Timeout("key generation".into()))??;

    let signer =
        ThresholdSigner::from_keygen(keep_id.clone(), member_id, members.to_vec(), threshold, output)?;
    info!(
        "Generated group key {} as member {}",
        hex::encode(signer.public_key_bytes()),
        signer.member_index()
    );
    Ok(signer)
}

/// Sign `digest` together with the other members of `subset`.
#[instrument(skip_all, fields(keep_id = %signer.keep_id(), sid = %sid), err(Debug))]
pub async fn calculate_signature(
    signer: &ThresholdSigner,
    sid: Identifier,
    digest: [u8; 32],
    subset: &[MemberId],
    channel: &BroadcastChannel,
    receiver: &mut ChannelReceiver,
    timeout: Duration,
) -> Result<Signature> {
    let mut participant = SignParticipant::new(sid, signer, subset, digest)?;
    debug!("Signing {} with {} members", hex::encode(digest), subset.len());

    let signature = tokio::time::timeout(timeout, drive(&mut participant, channel, receiver, || {}))
        .await
        .map_err(|_| InternalError::Timeout("signing".into()))??;
    info!("Produced signature over {}", hex::encode(digest));
    Ok(signature)
}
