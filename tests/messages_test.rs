//! Tests of wire framing.

use schain_consensus::{
    binary_consensus::messages::{BinaryConsensusMessage, BinaryMessageKind},
    catchup::messages::CatchupRequest,
    errors::ProtocolError,
    networking::messages::{decode_frame, encode_frame, Message, MAGIC_NUMBER, MAX_FRAME_SIZE},
    types::basic::*,
};

fn consensus_message() -> Message {
    Message::from(BinaryConsensusMessage {
        schain_id: SchainId::new(7),
        height: BlockHeight::new(3),
        proposer_index: ProposerIndex::new(2),
        round: Round::new(1),
        kind: BinaryMessageKind::Aux,
        value: true,
        sender: NodeId::new(4),
    })
}

fn header(magic: u64, len: u64) -> Vec<u8> {
    let mut frame = magic.to_le_bytes().to_vec();
    frame.extend_from_slice(&len.to_le_bytes());
    frame
}

#[test]
fn frame_carries_message_test() {
    let message = Message::from(CatchupRequest {
        schain_id: SchainId::new(7),
        from_height: BlockHeight::new(11),
    });
    let frame = encode_frame(&message).unwrap();

    assert_eq!(&frame[..8], &MAGIC_NUMBER.to_le_bytes());
    assert_eq!(frame.len() as u64, 16 + u64::from_le_bytes(frame[8..16].try_into().unwrap()));
    assert_eq!(decode_frame(&frame).unwrap(), message);
    assert_eq!(message.schain_id(), SchainId::new(7));
}

#[test]
fn frame_with_bad_magic_number_is_refused_test() {
    let mut frame = encode_frame(&consensus_message()).unwrap();
    frame[0] ^= 0xff;
    assert!(matches!(
        decode_frame(&frame),
        Err(ProtocolError::BadMagicNumber { .. })
    ));
}

#[test]
fn truncated_frames_are_refused_test() {
    assert!(matches!(
        decode_frame(&[0u8; 10]),
        Err(ProtocolError::TruncatedFrame { announced: 16, actual: 10 })
    ));

    let mut frame = encode_frame(&consensus_message()).unwrap();
    frame.pop();
    assert!(matches!(
        decode_frame(&frame),
        Err(ProtocolError::TruncatedFrame { .. })
    ));
}

#[test]
fn oversized_frame_is_refused_before_reading_body_test() {
    let frame = header(MAGIC_NUMBER, MAX_FRAME_SIZE + 1);
    assert!(matches!(
        decode_frame(&frame),
        Err(ProtocolError::FrameTooLarge { .. })
    ));
}

#[test]
fn undecodable_body_is_refused_test() {
    let mut frame = header(MAGIC_NUMBER, 3);
    frame.extend_from_slice(&[0xee, 0xee, 0xee]);
    assert!(matches!(
        decode_frame(&frame),
        Err(ProtocolError::UndecodableBody(_))
    ));
}
