use std::{net::SocketAddr, sync::Arc};

use log::{debug, warn};

use crate::{
    aio::MAX_DATAGRAM,
    net::Socket,
    protocol::{Decoded, Decoder, Incoming, Message, ProtocolError},
};

use super::{Context, Handler, Responder, ServerError, log_fault};

/// Keeps one receive outstanding on `socket` until it is closed. The next receive is
/// issued as soon as a datagram has been dispatched, whether or not its response has
/// been sent.
pub(super) fn receive<H: Handler>(socket: Socket, context: Arc<Context<H>>) {
    let next = socket.clone();
    socket.aio_recv_from(Vec::with_capacity(MAX_DATAGRAM), move |result| match result {
        Ok((datagram, from)) => {
            dispatch(&next, &context, &datagram, from);
            receive(next, context);
        }
        Err(_) if next.is_closed() => debug!("datagram socket closed, no longer receiving"),
        Err(e) => {
            log_fault(&ServerError::Read(e));
            receive(next, context);
        }
    });
}

/// Decodes a datagram that must hold exactly one request, and hands it over.
fn dispatch<H: Handler>(socket: &Socket, context: &Context<H>, datagram: &[u8], from: SocketAddr) {
    let mut decoder: <H::Request as Incoming>::Decoder = Default::default();
    let mut input = datagram;
    let request = match decoder.decode(&mut input) {
        Ok(Decoded::Done(request)) if input.is_empty() => request,
        Ok(Decoded::Done(_)) => {
            warn!("dropping datagram from {from}: {}", ProtocolError::TrailingBytes(input.len()));
            return;
        }
        Ok(Decoded::NeedMore(wanted)) => {
            warn!("dropping truncated datagram from {from}: {wanted} bytes missing");
            return;
        }
        Err(e) => {
            warn!("dropping datagram from {from}: {e}");
            return;
        }
    };

    context.peer.trace_operation(format_args!(
        "server socket #{}: decoded request from {from}",
        socket.id()
    ));

    let socket = socket.clone();
    let peer = context.peer.clone();
    let responder = Responder::new(move |response: Option<H::Response>| {
        let Some(response) = response else {
            warn!("handler dropped a request from {from} without responding");
            return;
        };
        let bytes = match response.serialize() {
            Ok(bytes) => bytes,
            Err(e) => return log_fault(&e.into()),
        };
        peer.trace_operation(format_args!(
            "server socket #{}: responding to {from}",
            socket.id()
        ));
        socket.aio_send_to(bytes, from, move |result| {
            if let Err(e) = result {
                log_fault(&ServerError::Write(e));
            }
        });
    });
    context.handler.handle(request, responder);
}
