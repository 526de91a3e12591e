/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that delivers [events](crate::events) to user-defined handlers and to the default
//! loggers.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::lifecycle::ExitFlag;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct EventHandlers {
    pub(crate) commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) start_consensus_handlers: Vec<HandlerPtr<StartConsensusEvent>>,
    pub(crate) decide_handlers: Vec<HandlerPtr<DecideEvent>>,
    pub(crate) defer_message_handlers: Vec<HandlerPtr<DeferMessageEvent>>,
    pub(crate) start_catchup_handlers: Vec<HandlerPtr<StartCatchupEvent>>,
    pub(crate) end_catchup_handlers: Vec<HandlerPtr<EndCatchupEvent>>,
    pub(crate) receive_catchup_request_handlers: Vec<HandlerPtr<ReceiveCatchupRequestEvent>>,
}

impl EventHandlers {
    /// Collect the user's handlers, adding the default logger of every event type if `log_events`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        commit_block_handler: Option<HandlerPtr<CommitBlockEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        receive_proposal_handler: Option<HandlerPtr<ReceiveProposalEvent>>,
        start_consensus_handler: Option<HandlerPtr<StartConsensusEvent>>,
        decide_handler: Option<HandlerPtr<DecideEvent>>,
        defer_message_handler: Option<HandlerPtr<DeferMessageEvent>>,
        start_catchup_handler: Option<HandlerPtr<StartCatchupEvent>>,
        end_catchup_handler: Option<HandlerPtr<EndCatchupEvent>>,
        receive_catchup_request_handler: Option<HandlerPtr<ReceiveCatchupRequestEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            commit_block_handlers: handlers(log_events, commit_block_handler),
            propose_handlers: handlers(log_events, propose_handler),
            receive_proposal_handlers: handlers(log_events, receive_proposal_handler),
            start_consensus_handlers: handlers(log_events, start_consensus_handler),
            decide_handlers: handlers(log_events, decide_handler),
            defer_message_handlers: handlers(log_events, defer_message_handler),
            start_catchup_handlers: handlers(log_events, start_catchup_handler),
            end_catchup_handlers: handlers(log_events, end_catchup_handler),
            receive_catchup_request_handlers: handlers(log_events, receive_catchup_request_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commit_block_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.start_consensus_handlers.is_empty()
            && self.decide_handlers.is_empty()
            && self.defer_message_handlers.is_empty()
            && self.start_catchup_handlers.is_empty()
            && self.end_catchup_handlers.is_empty()
            && self.receive_catchup_request_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CommitBlock(commit_block_event) => self
                .commit_block_handlers
                .iter()
                .for_each(|handler| handler(&commit_block_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::StartConsensus(start_consensus_event) => self
                .start_consensus_handlers
                .iter()
                .for_each(|handler| handler(&start_consensus_event)),

            Event::Decide(decide_event) => self
                .decide_handlers
                .iter()
                .for_each(|handler| handler(&decide_event)),

            Event::DeferMessage(defer_message_event) => self
                .defer_message_handlers
                .iter()
                .for_each(|handler| handler(&defer_message_event)),

            Event::StartCatchup(start_catchup_event) => self
                .start_catchup_handlers
                .iter()
                .for_each(|handler| handler(&start_catchup_event)),

            Event::EndCatchup(end_catchup_event) => self
                .end_catchup_handlers
                .iter()
                .for_each(|handler| handler(&end_catchup_event)),

            Event::ReceiveCatchupRequest(receive_catchup_request_event) => self
                .receive_catchup_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_catchup_request_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    exit: ExitFlag,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match event_subscriber.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => {
                if exit.is_exit_requested() {
                    return;
                }
            }
            // Every publisher is gone: the node is shutting down.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
