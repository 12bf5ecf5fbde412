//! GOOSE outstation: a publisher that transmits scheduled datasets with
//! state/sequence bookkeeping, and a subscriber that matches inbound
//! datasets by reference, validates their layout, and hands them to a
//! callback. The device wires the callback into the pending update queues.

use super::codec::{encode_frame, parse_frame, DataValue, GooseMessage, GOOSE_MULTICAST};
use super::link::GooseLink;
use crate::tags::{TagClass, TagManager};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One dataset member and the tag backing it.
#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub tag: String,
    pub class: TagClass,
}

/// Control block owning a published dataset and its parameters.
#[derive(Debug, Clone)]
pub struct GooseControlBlock {
    pub gocb_ref: String,
    pub dataset_ref: String,
    pub go_id: String,
    pub appid: u16,
    pub conf_rev: u32,
    pub time_to_live_ms: u32,
    pub vlan: Option<u16>,
    pub entries: Vec<DatasetEntry>,
}

struct PublicationState {
    st_num: u32,
    sq_num: u32,
    last: Vec<DataValue>,
}

struct ScheduledPublication {
    running: Arc<AtomicBool>,
}

pub struct GoosePublisher {
    link: Arc<dyn GooseLink>,
    manager: Arc<TagManager>,
    states: Mutex<HashMap<String, PublicationState>>,
    schedule: Mutex<HashMap<String, ScheduledPublication>>,
}

impl GoosePublisher {
    pub fn new(link: Arc<dyn GooseLink>, manager: Arc<TagManager>) -> Self {
        Self {
            link,
            manager,
            states: Mutex::new(HashMap::new()),
            schedule: Mutex::new(HashMap::new()),
        }
    }

    fn current_values(&self, block: &GooseControlBlock) -> Vec<DataValue> {
        block
            .entries
            .iter()
            .map(|entry| match entry.class {
                TagClass::Binary => {
                    DataValue::Boolean(self.manager.get_data_by_tag::<bool>(&entry.tag))
                }
                TagClass::Analog => {
                    DataValue::Float(self.manager.get_data_by_tag::<f64>(&entry.tag) as f32)
                }
            })
            .collect()
    }

    /// Publishes the dataset once. The state number advances (and the
    /// sequence number resets) whenever any dataset value changed since
    /// the previous transmission; otherwise only the sequence number
    /// counts up.
    pub fn publish(&self, block: &GooseControlBlock) {
        let values = self.current_values(block);
        let (st_num, sq_num) = {
            let mut states = self.states.lock();
            let state = states
                .entry(block.dataset_ref.clone())
                .or_insert(PublicationState {
                    st_num: 0,
                    sq_num: 0,
                    last: Vec::new(),
                });
            if state.st_num == 0 || state.last != values {
                state.st_num += 1;
                state.sq_num = 0;
            } else {
                state.sq_num += 1;
            }
            state.last = values.clone();
            (state.st_num, state.sq_num)
        };

        let mut message =
            GooseMessage::new(&block.gocb_ref, &block.dataset_ref, &block.go_id);
        message.time_allowed_to_live = block.time_to_live_ms;
        message.conf_rev = block.conf_rev;
        message.st_num = st_num;
        message.sq_num = sq_num;
        message.values = values;

        let frame = encode_frame(
            &GOOSE_MULTICAST,
            &self.link.mac(),
            block.vlan,
            block.appid,
            &message.encode(),
        );
        if let Err(err) = self.link.send(&frame) {
            error!("goose publish failed: {}", err);
        }
    }

    /// Schedules periodic transmission of a dataset. Fails when the
    /// dataset reference is already scheduled.
    pub fn schedule(self: &Arc<Self>, block: GooseControlBlock, interval: Duration) -> bool {
        let mut schedule = self.schedule.lock();
        if schedule.contains_key(&block.dataset_ref) {
            return false;
        }
        let running = Arc::new(AtomicBool::new(true));
        let publisher = self.clone();
        let flag = running.clone();
        let dataset_ref = block.dataset_ref.clone();
        thread::spawn(move || {
            debug!("publishing {} every {:?}", block.dataset_ref, interval);
            while flag.load(Ordering::SeqCst) {
                publisher.publish(&block);
                thread::sleep(interval);
            }
        });
        schedule.insert(dataset_ref, ScheduledPublication { running });
        true
    }

    /// Stops periodic transmission of a dataset. Returns false when the
    /// dataset reference was never scheduled.
    pub fn un_schedule(&self, dataset_ref: &str) -> bool {
        match self.schedule.lock().remove(dataset_ref) {
            Some(publication) => {
                publication.running.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Ends every scheduled publication.
    pub fn halt(&self) {
        for (_, publication) in self.schedule.lock().drain() {
            publication.running.store(false, Ordering::SeqCst);
        }
    }
}

pub type SubscriptionCallback = Arc<dyn Fn(&GooseMessage) + Send + Sync>;

struct Subscription {
    layout: Vec<DataValue>,
    callback: SubscriptionCallback,
}

pub struct GooseSubscriber {
    link: Arc<dyn GooseLink>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    running: Arc<AtomicBool>,
}

impl GooseSubscriber {
    pub fn new(link: Arc<dyn GooseLink>) -> Self {
        Self {
            link,
            subscriptions: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a dataset subscription. `layout` gives the expected
    /// member types; messages with a different shape are dropped.
    pub fn subscribe(
        &self,
        dataset_ref: &str,
        layout: Vec<DataValue>,
        callback: SubscriptionCallback,
    ) {
        self.subscriptions
            .lock()
            .insert(dataset_ref.to_string(), Subscription { layout, callback });
    }

    pub fn un_subscribe(&self, dataset_ref: &str) -> bool {
        self.subscriptions.lock().remove(dataset_ref).is_some()
    }

    /// Starts the receive thread.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriber = self.clone();
        thread::spawn(move || {
            let mut buffer = vec![0u8; 2048];
            while subscriber.running.load(Ordering::SeqCst) {
                let size = match subscriber.link.recv(&mut buffer) {
                    Ok(size) => size,
                    Err(err) => {
                        debug!("goose receive ended: {}", err);
                        break;
                    }
                };
                subscriber.dispatch(&buffer[..size]);
            }
        });
    }

    fn dispatch(&self, frame: &[u8]) {
        let Some((_appid, pdu)) = parse_frame(frame) else {
            return;
        };
        let message = match GooseMessage::decode(pdu) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping undecodable goose pdu: {}", err);
                return;
            }
        };
        let subscriptions = self.subscriptions.lock();
        let Some(subscription) = subscriptions.get(&message.dataset) else {
            return;
        };
        if subscription.layout.len() != message.values.len()
            || !subscription
                .layout
                .iter()
                .zip(message.values.iter())
                .all(|(expected, got)| expected.kind_matches(got))
        {
            warn!(
                "dataset {} does not match the subscribed type layout",
                message.dataset
            );
            return;
        }
        (subscription.callback)(&message);
    }

    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.subscriptions.lock().clear();
    }
}

/// Combined publisher and subscriber on one interface.
pub struct GooseOutstation {
    pub publisher: Arc<GoosePublisher>,
    pub subscriber: Arc<GooseSubscriber>,
}

impl GooseOutstation {
    pub fn new(link: Arc<dyn GooseLink>, manager: Arc<TagManager>) -> Self {
        Self {
            publisher: Arc::new(GoosePublisher::new(link.clone(), manager)),
            subscriber: Arc::new(GooseSubscriber::new(link)),
        }
    }

    /// Subscribes a dataset whose members mirror into tags: received
    /// values are queued as pending tag updates.
    pub fn subscribe_tags(
        &self,
        dataset_ref: &str,
        entries: Vec<DatasetEntry>,
        manager: Arc<TagManager>,
    ) {
        let layout: Vec<DataValue> = entries
            .iter()
            .map(|entry| match entry.class {
                TagClass::Binary => DataValue::Boolean(false),
                TagClass::Analog => DataValue::Float(0.0),
            })
            .collect();
        info!("subscribing to dataset {}", dataset_ref);
        self.subscriber.subscribe(
            dataset_ref,
            layout,
            Arc::new(move |message| {
                for (entry, value) in entries.iter().zip(message.values.iter()) {
                    match value {
                        DataValue::Boolean(status) => {
                            manager.add_updated_binary(&entry.tag, *status);
                        }
                        DataValue::Float(value) => {
                            manager.add_updated_analog(&entry.tag, *value as f64);
                        }
                    }
                }
            }),
        );
    }

    pub fn start(&self) {
        self.subscriber.start();
    }

    pub fn halt(&self) {
        self.subscriber.halt();
        self.publisher.halt();
    }
}

#[cfg(test)]
mod test {
    use super::{DatasetEntry, GooseControlBlock, GooseOutstation};
    use crate::comms::goose::codec::DataValue;
    use crate::comms::goose::link::InMemoryLink;
    use crate::tags::{TagClass, TagManager};
    use std::sync::Arc;
    use std::time::Duration;

    fn control_block() -> GooseControlBlock {
        GooseControlBlock {
            gocb_ref: "RelayLD/LLN0$GO$gcb01".to_string(),
            dataset_ref: "RelayLD/LLN0$dsTrip".to_string(),
            go_id: "relay-go".to_string(),
            appid: 0x3000,
            conf_rev: 1,
            time_to_live_ms: 10000,
            vlan: None,
            entries: vec![
                DatasetEntry {
                    tag: "trip".to_string(),
                    class: TagClass::Binary,
                },
                DatasetEntry {
                    tag: "freq".to_string(),
                    class: TagClass::Analog,
                },
            ],
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_publish_subscribe_round_trip() {
        let (a, b) = InMemoryLink::pair();

        let publishing = Arc::new(TagManager::new());
        publishing.add_internal_data("trip", true);
        publishing.add_binary_tag("trip");
        publishing.add_internal_data("freq", 59.95);
        publishing.add_analog_tag("freq");

        let subscribing = Arc::new(TagManager::new());
        subscribing.add_internal_data("trip", false);
        subscribing.add_binary_tag("trip");
        subscribing.add_internal_data("freq", 0.0);
        subscribing.add_analog_tag("freq");

        let sender = GooseOutstation::new(Arc::new(a), publishing.clone());
        let receiver = GooseOutstation::new(Arc::new(b), subscribing.clone());

        let block = control_block();
        receiver.subscribe_tags(
            &block.dataset_ref,
            block.entries.clone(),
            subscribing.clone(),
        );
        receiver.start();

        sender.publisher.publish(&block);

        assert!(wait_for(|| subscribing.is_updated_binary("trip")
            && subscribing.is_updated_analog("freq")));
        subscribing.update_internal_data();
        assert!(subscribing.get_data_by_tag::<bool>("trip"));
        assert!((subscribing.get_data_by_tag::<f64>("freq") - 59.95).abs() < 0.01);
    }

    #[test]
    fn test_state_and_sequence_numbers() {
        let (a, _b) = InMemoryLink::pair();
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("trip", false);
        manager.add_binary_tag("trip");
        manager.add_internal_data("freq", 60.0);
        manager.add_analog_tag("freq");

        let outstation = GooseOutstation::new(Arc::new(a), manager.clone());
        let block = control_block();

        // First transmission opens state 1 sequence 0, retransmissions
        // advance only the sequence number
        outstation.publisher.publish(&block);
        outstation.publisher.publish(&block);
        outstation.publisher.publish(&block);
        {
            let states = outstation.publisher.states.lock();
            let state = states.get(&block.dataset_ref).unwrap();
            assert_eq!((state.st_num, state.sq_num), (1, 2));
        }

        // A value change bumps the state number and resets the sequence
        manager.add_updated_binary("trip", true);
        manager.update_internal_data();
        manager.clear_updated_tags();
        outstation.publisher.publish(&block);
        {
            let states = outstation.publisher.states.lock();
            let state = states.get(&block.dataset_ref).unwrap();
            assert_eq!((state.st_num, state.sq_num), (2, 0));
        }
    }

    #[test]
    fn test_layout_mismatch_is_dropped() {
        let (a, b) = InMemoryLink::pair();
        let publishing = Arc::new(TagManager::new());
        publishing.add_internal_data("trip", true);
        publishing.add_binary_tag("trip");
        publishing.add_internal_data("freq", 59.9);
        publishing.add_analog_tag("freq");

        let subscribing = Arc::new(TagManager::new());
        subscribing.add_internal_data("trip", false);
        subscribing.add_binary_tag("trip");

        let sender = GooseOutstation::new(Arc::new(a), publishing.clone());
        let receiver = GooseOutstation::new(Arc::new(b), subscribing.clone());

        let block = control_block();
        // Subscribe with a single-boolean layout while the publisher
        // sends boolean + float
        receiver.subscribe_tags(
            &block.dataset_ref,
            vec![DatasetEntry {
                tag: "trip".to_string(),
                class: TagClass::Binary,
            }],
            subscribing.clone(),
        );
        receiver.start();

        sender.publisher.publish(&block);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!subscribing.is_updated_binary("trip"));
    }

    #[test]
    fn test_schedule_and_un_schedule() {
        let (a, b) = InMemoryLink::pair();
        let publishing = Arc::new(TagManager::new());
        publishing.add_internal_data("trip", false);
        publishing.add_binary_tag("trip");
        publishing.add_internal_data("freq", 60.0);
        publishing.add_analog_tag("freq");

        let subscribing = Arc::new(TagManager::new());
        subscribing.add_internal_data("trip", false);
        subscribing.add_binary_tag("trip");
        subscribing.add_internal_data("freq", 0.0);
        subscribing.add_analog_tag("freq");

        let sender = GooseOutstation::new(Arc::new(a), publishing.clone());
        let receiver = GooseOutstation::new(Arc::new(b), subscribing.clone());
        let block = control_block();
        receiver.subscribe_tags(
            &block.dataset_ref,
            block.entries.clone(),
            subscribing.clone(),
        );
        receiver.start();

        assert!(sender
            .publisher
            .schedule(block.clone(), Duration::from_millis(20)));
        // Re-scheduling the same dataset reference is refused
        assert!(!sender
            .publisher
            .schedule(block.clone(), Duration::from_millis(20)));

        assert!(wait_for(|| subscribing.is_updated_analog("freq")));

        assert!(sender.publisher.un_schedule(&block.dataset_ref));
        assert!(!sender.publisher.un_schedule(&block.dataset_ref));
    }
}
