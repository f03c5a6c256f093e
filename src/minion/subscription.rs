use nostr_types::{ClientMessage, Filter, SubscriptionId};

#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    generation: u64,
    filters: Vec<Filter>,
    eose: bool,
}

impl Subscription {
    pub fn new(id: &str, generation: u64, filters: Vec<Filter>) -> Subscription {
        Subscription {
            id: id.to_owned(),
            generation,
            filters,
            eose: false,
        }
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_generation(&self) -> u64 {
        self.generation
    }

    pub fn set_eose(&mut self) {
        self.eose = true;
    }

    pub fn eose(&self) -> bool {
        self.eose
    }

    pub fn req_message(&self) -> ClientMessage {
        ClientMessage::Req(SubscriptionId(self.get_id()), self.filters.clone())
    }

    pub fn close_message(&self) -> ClientMessage {
        ClientMessage::Close(SubscriptionId(self.get_id()))
    }
}
