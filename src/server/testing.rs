//! Test doubles shared by the server tests

use std::sync::Mutex;

use super::{Client, ServerEvents};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(u64),
    Left(u64),
    Message(u64, String),
}

/// Records every callback in order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ServerEvents for Recorder {
    fn client_connected(&self, client: &Client) {
        self.push(Event::Connected(client.id()));
    }

    fn client_left(&self, client: &Client) {
        self.push(Event::Left(client.id()));
    }

    fn message_received(&self, client: &Client, message: String) {
        self.push(Event::Message(client.id(), message));
    }
}
