use std::sync::Arc;

use easy_parallel::Parallel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::BoxError,
    identity::{Identity, PeerId},
    net::{local::LocalNetwork, BroadcastChannel, Message, Provider, SerdeMessage},
    participants::{Group, MemberIndex, MembershipValidator, OperatorMembershipValidator},
    protocol::{AsyncMachine, AsyncState, MessageHistory, State},
    scope::Scope,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announce {
    member: MemberIndex,
}

impl SerdeMessage for Announce {
    const TYPE: &'static str = "e2e/announce";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Confirm {
    member: MemberIndex,
}

impl SerdeMessage for Confirm {
    const TYPE: &'static str = "e2e/confirm";
}

/// Everything a member carries from one state to the next.
#[derive(Clone)]
struct Context {
    member: MemberIndex,
    channel: BroadcastChannel,
    validator: Arc<OperatorMembershipValidator>,
    group: Group,
    history: MessageHistory,
    log: Arc<Mutex<Vec<String>>>,
}

impl Context {
    fn log(&self, entry: &str) {
        self.log.lock().push(entry.to_string());
    }

    /// Record any message from a legitimate member, whatever its type.
    fn receive(&self, message: Message) -> Result<(), BoxError> {
        let claimed = if let Some(announce) = message.payload::<Announce>() {
            announce.member
        } else if let Some(confirm) = message.payload::<Confirm>() {
            confirm.member
        } else {
            return Err("unexpected payload".into());
        };
        if !self.group.is_operating(claimed)
            || !self
                .validator
                .is_valid_membership(claimed, message.sender_public_key())
        {
            return Err(format!("sender is not member {}", claimed).into());
        }
        self.history.receive_to_history(message);
        Ok(())
    }

    fn heard_from_everyone(&self, message_type: &str) -> bool {
        self.history.count(message_type) >= self.group.operating_members().len()
    }
}

struct Start(Context);
struct Announcing(Context);
struct Confirming(Context);

impl State for Start {
    fn initiate(&mut self, _: &Scope) -> Result<(), BoxError> {
        self.0.log("1-initiate");
        Ok(())
    }

    fn receive(&mut self, message: Message) -> Result<(), BoxError> {
        self.0.receive(message)
    }

    fn member_index(&self) -> MemberIndex {
        self.0.member
    }
}

impl AsyncState for Start {
    fn can_transition(&self) -> bool {
        true
    }

    fn next(&mut self) -> Result<Option<Box<dyn AsyncState>>, BoxError> {
        self.0.log("1-done");
        Ok(Some(Box::new(Announcing(self.0.clone()))))
    }
}

impl State for Announcing {
    fn initiate(&mut self, scope: &Scope) -> Result<(), BoxError> {
        self.0.log("2-initiate");
        self.0.channel.send(
            scope,
            &Announce {
                member: self.0.member,
            },
        )?;
        Ok(())
    }

    fn receive(&mut self, message: Message) -> Result<(), BoxError> {
        self.0.receive(message)
    }

    fn member_index(&self) -> MemberIndex {
        self.0.member
    }
}

impl AsyncState for Announcing {
    fn can_transition(&self) -> bool {
        self.0.heard_from_everyone(<Announce as SerdeMessage>::TYPE)
    }

    fn next(&mut self) -> Result<Option<Box<dyn AsyncState>>, BoxError> {
        self.0.log("2-done");
        Ok(Some(Box::new(Confirming(self.0.clone()))))
    }
}

impl State for Confirming {
    fn initiate(&mut self, scope: &Scope) -> Result<(), BoxError> {
        self.0.log("3-initiate");
        self.0.channel.send(
            scope,
            &Confirm {
                member: self.0.member,
            },
        )?;
        Ok(())
    }

    fn receive(&mut self, message: Message) -> Result<(), BoxError> {
        self.0.receive(message)
    }

    fn member_index(&self) -> MemberIndex {
        self.0.member
    }
}

impl AsyncState for Confirming {
    fn can_transition(&self) -> bool {
        self.0.heard_from_everyone(<Confirm as SerdeMessage>::TYPE)
    }

    fn next(&mut self) -> Result<Option<Box<dyn AsyncState>>, BoxError> {
        self.0.log("3-done");
        Ok(None)
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.retransmission.interval_ms = 50;
    config.retransmission.cycles = 5;
    config.machine.transition_check_interval_ms = 10;
    config
}

fn channel(network: &LocalNetwork, identity: &Identity, config: &Config) -> BroadcastChannel {
    let provider = Provider::new(identity.clone(), network.connect(identity), config.clone());
    let channel = provider.broadcast_channel_for("e2e").unwrap();
    channel.register_unmarshaler::<Announce>().unwrap();
    channel.register_unmarshaler::<Confirm>().unwrap();
    channel
}

#[test]
fn test_three_members_run_async_protocol() {
    let config = config();
    let network = LocalNetwork::new();
    let identities: Vec<Identity> = (0..3).map(|_| Identity::generate()).collect();
    let validator = Arc::new(OperatorMembershipValidator::new(
        identities
            .iter()
            .map(|id| id.peer_id().as_bytes().to_vec())
            .collect(),
    ));
    let group = Group::new(3, 1).unwrap();
    let scope = Scope::new();

    // Every machine listens before any of them starts sending.
    let mut machines = Vec::new();
    let mut logs = Vec::new();
    for (i, identity) in identities.iter().enumerate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context {
            member: MemberIndex::new(i as u8 + 1).unwrap(),
            channel: channel(&network, identity, &config),
            validator: validator.clone(),
            group: group.clone(),
            history: MessageHistory::new(),
            log: log.clone(),
        };
        machines.push(AsyncMachine::new(
            &context.channel,
            &scope,
            Box::new(Start(context.clone())),
            &config.machine,
        ));
        logs.push(log);
    }

    // Somebody outside the group, pretending to be member 2.
    let rogue = channel(&network, &Identity::generate(), &config);
    rogue
        .send_once(&Announce {
            member: MemberIndex::new(2).unwrap(),
        })
        .unwrap();

    let results = Parallel::new()
        .each(machines, |machine| smol::block_on(machine.execute()))
        .run();
    scope.cancel();

    let members: Vec<PeerId> = identities.iter().map(Identity::peer_id).collect();
    for (result, log) in results.into_iter().zip(logs) {
        let last = result.unwrap();
        let last = last.downcast_ref::<Confirming>().unwrap();
        assert_eq!(
            log.lock().join(","),
            "1-initiate,1-done,2-initiate,2-done,3-initiate,3-done"
        );

        let mut senders: Vec<PeerId> = last
            .0
            .history
            .all_received(<Announce as SerdeMessage>::TYPE)
            .iter()
            .map(|m| m.sender().clone())
            .collect();
        senders.sort();
        let mut expected = members.clone();
        expected.sort();
        assert_eq!(senders, expected);
    }
}

#[test]
fn test_disqualified_member_is_not_waited_for() {
    let config = config();
    let network = LocalNetwork::new();
    let identities: Vec<Identity> = (0..2).map(|_| Identity::generate()).collect();
    let validator = Arc::new(OperatorMembershipValidator::new(
        identities
            .iter()
            .map(|id| id.peer_id().as_bytes().to_vec())
            .collect(),
    ));
    let mut group = Group::new(2, 1).unwrap();
    group.mark_disqualified(MemberIndex::new(2).unwrap());

    let log = Arc::new(Mutex::new(Vec::new()));
    let context = Context {
        member: MemberIndex::new(1).unwrap(),
        channel: channel(&network, &identities[0], &config),
        validator,
        group,
        history: MessageHistory::new(),
        log,
    };
    let scope = Scope::new();
    let machine = AsyncMachine::new(
        &context.channel,
        &scope,
        Box::new(Announcing(context.clone())),
        &config.machine,
    );

    // Member 2 keeps talking, but its messages are rejected.
    let outcast = channel(&network, &identities[1], &config);
    outcast
        .send(
            &scope,
            &Announce {
                member: MemberIndex::new(2).unwrap(),
            },
        )
        .unwrap();

    let last = smol::block_on(machine.execute()).unwrap();
    scope.cancel();
    assert!(last.downcast_ref::<Confirming>().is_some());
    assert_eq!(context.history.count(<Announce as SerdeMessage>::TYPE), 1);
    assert_eq!(
        context.log.lock().join(","),
        "2-initiate,2-done,3-initiate,3-done"
    );
}
