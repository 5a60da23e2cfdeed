//! Client-side dispatcher: routes responses to retrievers by logical
//! id.

use std::sync::Arc;

use tracing::debug;

use crate::buf::Fetcher;
use crate::protocol::{
    unpack_type, CloseRespond, DialRespond, Kind, ResumeRespond, RetrieveRespond, SendRespond,
};
use crate::session::{Cancels, Retrievers};

pub struct RequestDispatcher {
    retrievers: Arc<Retrievers>,
}

impl RequestDispatcher {
    pub fn new(retrievers: Arc<Retrievers>) -> Self {
        Self { retrievers }
    }

    /// Run one decrypted segment of responses. Bad sub-responses are
    /// logged and skipped.
    pub async fn dispatch(&self, seg: &[u8], cancels: &mut Cancels) {
        let mut f = Fetcher::new(seg);
        loop {
            let header = match f.fetch(1) {
                Ok(b) => b[0],
                Err(_) => return,
            };
            let (kind, data) = unpack_type(header);
            let kind = match Kind::try_from(kind) {
                Ok(k) => k,
                Err(e) => {
                    debug!(error = %e, "skipping unknown respond");
                    continue;
                }
            };
            match kind {
                Kind::Dial => match DialRespond::parse(&mut f) {
                    Ok(rsp) => {
                        debug!(id = %rsp.id, code = data, "dial respond received");
                        if let Err(e) = self.retrievers.registered(data, rsp, cancels).await {
                            debug!(error = %e, "dial respond rejected");
                        }
                    }
                    Err(e) => debug!(error = %e, "invalid dial respond"),
                },
                Kind::Retrieve => match RetrieveRespond::parse(&mut f) {
                    Ok(rsp) => {
                        debug!(id = %rsp.id, code = data, "retrieve respond received");
                        if let Err(e) = self.retrievers.retrieved(data, rsp, cancels).await {
                            debug!(error = %e, "retrieve respond rejected");
                        }
                    }
                    Err(e) => debug!(error = %e, "invalid retrieve respond"),
                },
                Kind::Resume => match ResumeRespond::parse(&mut f) {
                    Ok(rsp) => {
                        debug!(id = %rsp.id, code = data, "resume respond received");
                        if let Err(e) = self.retrievers.resumed(data, rsp, cancels).await {
                            debug!(error = %e, "resume respond rejected");
                        }
                    }
                    Err(e) => debug!(error = %e, "invalid resume respond"),
                },
                Kind::Send => match SendRespond::parse(&mut f) {
                    Ok(rsp) => {
                        debug!(id = %rsp.id, code = data, "send respond received");
                        if let Err(e) = self.retrievers.sent(data, rsp, cancels).await {
                            debug!(error = %e, "send respond rejected");
                        }
                    }
                    Err(e) => debug!(error = %e, "invalid send respond"),
                },
                Kind::Close => match CloseRespond::parse(&mut f) {
                    Ok(rsp) => {
                        debug!(id = %rsp.id, code = data, "close respond received");
                        if let Err(e) = self.retrievers.closed(data, rsp, cancels).await {
                            debug!(error = %e, "close respond rejected");
                        }
                    }
                    Err(e) => debug!(error = %e, "invalid close respond"),
                },
            }
        }
    }
}
