//! Routing table shared by the in-process hub and the broker daemon.
//!
//! The router knows which peer owns which object and subscription and where
//! each in-flight request came from. It never performs I/O: every operation
//! returns the events to deliver and the caller pushes them to the peers'
//! queues or sockets.

use crate::reactor::{
    wildcard_match, BusEvent, CallId, InboundRequest, ListenerId, MethodInfo, ObjectDescriptor, ObjectId,
    ObjectInfo, RequestId, Status,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

pub(crate) type PeerId = u64;

/// An event addressed to one peer.
pub(crate) type Delivery = (PeerId, BusEvent);

struct RoutedObject {
    name: String,
    owner: PeerId,
    methods: Vec<MethodInfo>,
}

struct Subscription {
    id: ListenerId,
    owner: PeerId,
    pattern: String,
}

struct Route {
    caller: PeerId,
    call: CallId,
    callee: PeerId,
}

#[derive(Default)]
pub(crate) struct Router {
    next_object: u32,
    next_listener: u32,
    next_request: u64,
    objects: BTreeMap<ObjectId, RoutedObject>,
    subscriptions: Vec<Subscription>,
    routes: HashMap<RequestId, Route>,
}

impl Router {
    pub(crate) fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publish an object. Names are unique bus-wide.
    pub(crate) fn add_object(
        &mut self,
        owner: PeerId,
        descriptor: &ObjectDescriptor,
    ) -> Result<ObjectId, Status> {
        if descriptor.name.is_empty() || self.objects.values().any(|o| o.name == descriptor.name) {
            return Err(Status::InvalidArgument);
        }
        self.next_object += 1;
        let id = ObjectId(self.next_object);
        self.objects.insert(
            id,
            RoutedObject {
                name: descriptor.name.clone(),
                owner,
                methods: descriptor.methods.clone(),
            },
        );
        Ok(id)
    }

    pub(crate) fn remove_object(&mut self, owner: PeerId, id: ObjectId) -> Result<(), Status> {
        if !self.objects.get(&id).is_some_and(|o| o.owner == owner) {
            return Err(Status::NotFound);
        }
        self.objects.remove(&id);
        Ok(())
    }

    pub(crate) fn subscribe(&mut self, owner: PeerId, pattern: &str) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.subscriptions.push(Subscription {
            id,
            owner,
            pattern: pattern.to_string(),
        });
        id
    }

    pub(crate) fn unsubscribe(&mut self, owner: PeerId, id: ListenerId) -> Result<(), Status> {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| !(s.id == id && s.owner == owner));
        if self.subscriptions.len() == before {
            return Err(Status::NotFound);
        }
        Ok(())
    }

    /// Objects whose name matches `path`; an empty result is `NotFound`.
    pub(crate) fn lookup(&self, path: &str) -> Result<Vec<ObjectInfo>, Status> {
        let found: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|(_, o)| wildcard_match(path, &o.name))
            .map(|(id, o)| ObjectInfo {
                path: o.name.clone(),
                id: *id,
                methods: o.methods.clone(),
            })
            .collect();
        if found.is_empty() {
            return Err(Status::NotFound);
        }
        Ok(found)
    }

    pub(crate) fn lookup_id(&self, path: &str) -> Result<ObjectId, Status> {
        self.objects
            .iter()
            .find(|(_, o)| o.name == path)
            .map(|(id, _)| *id)
            .ok_or(Status::NotFound)
    }

    /// Record a request from `caller` and address it to the object's owner.
    pub(crate) fn invoke(
        &mut self,
        caller: PeerId,
        call: CallId,
        object: ObjectId,
        method: &str,
        args: Bytes,
    ) -> Result<Delivery, Status> {
        let callee = self.objects.get(&object).ok_or(Status::NotFound)?.owner;
        self.next_request += 1;
        let request = RequestId(self.next_request);
        self.routes.insert(
            request,
            Route {
                caller,
                call,
                callee,
            },
        );
        Ok((
            callee,
            BusEvent::Request(InboundRequest {
                id: request,
                object,
                method: method.to_string(),
                args,
            }),
        ))
    }

    fn route_for(&self, callee: PeerId, request: RequestId) -> Result<&Route, Status> {
        match self.routes.get(&request) {
            Some(route) if route.callee == callee => Ok(route),
            Some(_) => Err(Status::PermissionDenied),
            None => Err(Status::NotFound),
        }
    }

    pub(crate) fn reply(
        &self,
        callee: PeerId,
        request: RequestId,
        data: Bytes,
    ) -> Result<Delivery, Status> {
        let route = self.route_for(callee, request)?;
        Ok((route.caller, BusEvent::Data { call: route.call, data }))
    }

    pub(crate) fn complete(
        &mut self,
        callee: PeerId,
        request: RequestId,
        status: Status,
    ) -> Result<Delivery, Status> {
        self.route_for(callee, request)?;
        let route = self.routes.remove(&request).ok_or(Status::NotFound)?;
        Ok((route.caller, BusEvent::Complete { call: route.call, status }))
    }

    /// Fan an event out to every matching subscription.
    pub(crate) fn publish(&self, event: &str, data: &Bytes) -> Vec<Delivery> {
        self.subscriptions
            .iter()
            .filter(|s| wildcard_match(&s.pattern, event))
            .map(|s| {
                (
                    s.owner,
                    BusEvent::Event {
                        listener: s.id,
                        event: event.to_string(),
                        data: data.clone(),
                    },
                )
            })
            .collect()
    }

    /// Drop everything a departing peer owned.
    ///
    /// Requests still waiting on the peer are completed with
    /// `ConnectionFailed` for their callers.
    pub(crate) fn remove_peer(&mut self, peer: PeerId) -> Vec<Delivery> {
        self.objects.retain(|_, o| o.owner != peer);
        self.subscriptions.retain(|s| s.owner != peer);

        let orphaned: Vec<RequestId> = self
            .routes
            .iter()
            .filter(|(_, r)| r.callee == peer || r.caller == peer)
            .map(|(id, _)| *id)
            .collect();

        let mut deliveries = Vec::new();
        for id in orphaned {
            if let Some(route) = self.routes.remove(&id) {
                if route.callee == peer && route.caller != peer {
                    deliveries.push((
                        route.caller,
                        BusEvent::Complete {
                            call: route.call,
                            status: Status::ConnectionFailed,
                        },
                    ));
                }
            }
        }
        deliveries
    }
}
