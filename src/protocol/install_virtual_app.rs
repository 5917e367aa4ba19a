//! Install a virtual app: fund one app through two real channels that
//! share an intermediary, without giving the app a multisig of its own.
//!
//! The intermediary countersigns both funding agreements and the app's
//! initial state, and relays the outer parties' signatures; the endpoint
//! channels never learn anything about each other beyond those signatures.
//!
//! M1 initiator -> intermediary: app signature + left agreement signature.
//! M2 intermediary -> responder: relayed + own app signatures + right
//!    agreement signature.
//! M3 responder -> intermediary: app signature + right agreement
//!    signature.
//! M4 intermediary -> initiator: own + relayed app signatures + left
//!    agreement signature.

use super::{CommitmentPurpose, Context, Instruction, Opcode, ProtocolError, Role};
use crate::abiencode::types::{Address, Hash, U256};
use crate::channel::{StateChannel, VirtualAppAgreement};
use crate::commitment::{Commitment, SetStateCommitment, VirtualAppAgreementCommitment};
use crate::messages::InstallVirtualAppParams;
use std::collections::BTreeMap;

pub(super) fn script(role: Role) -> Option<&'static [Instruction]> {
    match role {
        Role::Initiator => Some(INITIATOR),
        Role::Intermediary => Some(INTERMEDIARY),
        Role::Responder => Some(RESPONDER),
    }
}

const INITIATOR: &[Instruction] = &[
    Instruction::Transition(begin_initiator),
    Instruction::Op(Opcode::OpSign),
    Instruction::Transition(send_m1),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m4),
    Instruction::Op(Opcode::StateTransitionCommit),
];

const INTERMEDIARY: &[Instruction] = &[
    Instruction::Transition(begin_intermediary),
    Instruction::Transition(verify_m1),
    Instruction::Op(Opcode::OpSignAsIntermediary),
    Instruction::Transition(send_m2),
    Instruction::Op(Opcode::IoSendAndWait),
    Instruction::Transition(handle_m3),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m4),
    Instruction::Op(Opcode::IoSend),
];

const RESPONDER: &[Instruction] = &[
    Instruction::Transition(begin_responder),
    Instruction::Transition(verify_m2),
    Instruction::Op(Opcode::OpSign),
    Instruction::Op(Opcode::StateTransitionCommit),
    Instruction::Transition(send_m3),
    Instruction::Op(Opcode::IoSend),
];

fn agreement(
    params: &InstallVirtualAppParams,
    target: Hash,
    endpoint: Address,
) -> VirtualAppAgreement {
    VirtualAppAgreement {
        target,
        capital: params.capital,
        expiry: params.expiry,
        beneficiaries: vec![endpoint, params.intermediary],
        intermediary: params.intermediary,
    }
}

fn push_set_state(
    ctx: &mut Context,
    params: &InstallVirtualAppParams,
    target: Hash,
) -> Result<(), ProtocolError> {
    ctx.push_commitment(
        CommitmentPurpose::VirtualAppSetState,
        Commitment::SetState(SetStateCommitment {
            network: ctx.network,
            app_identity_hash: target,
            state_hash: params.initial_state.hash()?,
            version_number: 0,
            timeout: params.default_timeout,
        }),
    );
    Ok(())
}

fn push_agreement(
    ctx: &mut Context,
    purpose: CommitmentPurpose,
    channel: &StateChannel,
    agreement: &VirtualAppAgreement,
) {
    ctx.push_commitment(
        purpose,
        Commitment::VirtualAppAgreement(VirtualAppAgreementCommitment {
            network: ctx.network,
            multisig: channel.multisig_address(),
            multisig_owners: channel.multisig_owners().to_vec(),
            target: agreement.target,
            capital: agreement.capital,
            expiry: agreement.expiry,
            beneficiaries: agreement.beneficiaries.clone(),
        }),
    );
}

/// Each endpoint locks the app's capital out of its own free balance in
/// its channel with the intermediary; the intermediary nets zero once
/// both agreements settle.
fn capital_decrement(
    params: &InstallVirtualAppParams,
    endpoint: Address,
) -> BTreeMap<Address, U256> {
    let mut decrements = BTreeMap::new();
    decrements.insert(endpoint, params.capital);
    decrements
}

fn begin_initiator(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();

    let app = params.app_instance(left.num_installed_apps());
    let target = app.identity_hash()?;
    let left_agreement = agreement(&params, target, params.initiating);
    let next = left.install_virtual_app(
        app,
        left_agreement.clone(),
        &capital_decrement(&params, params.initiating),
    )?;

    push_set_state(ctx, &params, target)?;
    push_agreement(ctx, CommitmentPurpose::LeftAgreement, &next, &left_agreement);
    ctx.target_app = Some(target);
    ctx.put_channel(next);
    Ok(())
}

fn send_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let app_sig = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let agreement_sig = ctx.our_signature(CommitmentPurpose::LeftAgreement)?;
    let msg = ctx.compose(
        1,
        params.intermediary,
        [Some(app_sig), Some(agreement_sig), None],
    );
    ctx.send(msg);
    Ok(())
}

fn handle_m4(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let msg = ctx.expect_message(-4)?;
    let (intermediary_app, responder_app, intermediary_agreement) =
        (msg.signature, msg.signature2, msg.signature3);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.intermediary,
        intermediary_app.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.responding,
        responder_app.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::LeftAgreement,
        params.intermediary,
        intermediary_agreement.as_ref(),
    )
}

fn begin_intermediary(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let left = ctx
        .channel_by_owners(params.initiating, params.intermediary)?
        .clone();
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();

    let target = params.target()?;
    let left_agreement = agreement(&params, target, params.initiating);
    let right_agreement = agreement(&params, target, params.responding);

    // The intermediary applies the same transitions as each endpoint so
    // the two owners of every multisig keep identical channel values.
    let next_left = left.install_virtual_app(
        params.app_instance(left.num_installed_apps()),
        left_agreement.clone(),
        &capital_decrement(&params, params.initiating),
    )?;
    let next_right = right.install_virtual_app(
        params.app_instance(right.num_installed_apps()),
        right_agreement.clone(),
        &capital_decrement(&params, params.responding),
    )?;

    push_set_state(ctx, &params, target)?;
    push_agreement(
        ctx,
        CommitmentPurpose::LeftAgreement,
        &next_left,
        &left_agreement,
    );
    push_agreement(
        ctx,
        CommitmentPurpose::RightAgreement,
        &next_right,
        &right_agreement,
    );
    ctx.target_app = Some(target);
    ctx.put_channel(next_left);
    ctx.put_channel(next_right);
    Ok(())
}

fn verify_m1(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let msg = ctx.expect_message(1)?;
    let (app_sig, agreement_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.initiating,
        app_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::LeftAgreement,
        params.initiating,
        agreement_sig.as_ref(),
    )
}

fn send_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let relayed_app =
        ctx.signature_of(CommitmentPurpose::VirtualAppSetState, params.initiating)?;
    let own_app = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let right_sig = ctx.our_signature(CommitmentPurpose::RightAgreement)?;
    let msg = ctx.compose(
        2,
        params.responding,
        [Some(relayed_app), Some(own_app), Some(right_sig)],
    );
    ctx.send(msg);
    Ok(())
}

fn handle_m3(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let msg = ctx.expect_message(-3)?;
    let (app_sig, agreement_sig) = (msg.signature, msg.signature2);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.responding,
        app_sig.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::RightAgreement,
        params.responding,
        agreement_sig.as_ref(),
    )
}

fn send_m4(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let own_app = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let relayed_app =
        ctx.signature_of(CommitmentPurpose::VirtualAppSetState, params.responding)?;
    let left_sig = ctx.our_signature(CommitmentPurpose::LeftAgreement)?;
    let msg = ctx.compose(
        -4,
        params.initiating,
        [Some(own_app), Some(relayed_app), Some(left_sig)],
    );
    ctx.send(msg);
    Ok(())
}

fn begin_responder(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let right = ctx
        .channel_by_owners(params.responding, params.intermediary)?
        .clone();

    let app = params.app_instance(right.num_installed_apps());
    let target = app.identity_hash()?;
    let right_agreement = agreement(&params, target, params.responding);
    let next = right.install_virtual_app(
        app,
        right_agreement.clone(),
        &capital_decrement(&params, params.responding),
    )?;

    push_set_state(ctx, &params, target)?;
    push_agreement(
        ctx,
        CommitmentPurpose::RightAgreement,
        &next,
        &right_agreement,
    );
    ctx.target_app = Some(target);
    ctx.put_channel(next);
    Ok(())
}

fn verify_m2(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let msg = ctx.expect_message(2)?;
    let (initiator_app, intermediary_app, agreement_sig) =
        (msg.signature, msg.signature2, msg.signature3);
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.initiating,
        initiator_app.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::VirtualAppSetState,
        params.intermediary,
        intermediary_app.as_ref(),
    )?;
    ctx.validate_commitment_signature(
        CommitmentPurpose::RightAgreement,
        params.intermediary,
        agreement_sig.as_ref(),
    )
}

fn send_m3(ctx: &mut Context) -> Result<(), ProtocolError> {
    let params = ctx.install_virtual_params()?.clone();
    let app_sig = ctx.our_signature(CommitmentPurpose::VirtualAppSetState)?;
    let agreement_sig = ctx.our_signature(CommitmentPurpose::RightAgreement)?;
    let msg = ctx.compose(
        -3,
        params.intermediary,
        [Some(app_sig), Some(agreement_sig), None],
    );
    ctx.send(msg);
    Ok(())
}
