mod common;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    thread,
    time::Duration,
};

use common::{Net, eager_context, tensor};
use elastic::{
    Collective, ModelState, State, StateErr, Tracked,
    collective::{GroupConfig, TcpGroup},
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn config(rank: usize, size: usize, hub: SocketAddr) -> GroupConfig {
    GroupConfig::new(rank, NonZeroUsize::new(size).unwrap(), hub)
        .with_retries(NonZeroUsize::new(10).unwrap(), Duration::from_millis(50))
}

/// Forms a TCP group over loopback and runs `f` on one thread per rank.
fn on_each_tcp_rank<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(TcpGroup) -> T + Sync,
{
    let hub = TcpGroup::bind(loopback(), NonZeroUsize::new(size).unwrap()).unwrap();
    let addr = hub.local_addr().unwrap();

    thread::scope(|s| {
        let f = &f;
        let mut handles = vec![s.spawn(move || f(hub.accept().unwrap()))];

        for rank in 1..size {
            handles.push(s.spawn(move || f(TcpGroup::join(&config(rank, size, addr)).unwrap())));
        }

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn model_state_syncs_over_tcp() {
    let results = on_each_tcp_rank(4, |group| {
        let root = group.rank() == 0;
        let net = if root {
            Net::new(&[1.0, 2.0], 0.5, &[0.25, 0.75])
        } else {
            Net::new(&[0.0, 0.0], 0.0, &[0.0, 0.0])
        };
        let epoch = Tracked::new(if root { 7_u32 } else { 0 });

        let mut state = ModelState::builder(eager_context(group), net.model.clone())
            .track(epoch.attribute("epoch"))
            .build()
            .unwrap();
        state.sync().unwrap();

        net.step(3.0);
        epoch.set(100);
        state.restore().unwrap();

        (net.weight.to_vec(), net.bias.to_vec(), net.moment.to_vec(), epoch.get())
    });

    for result in results {
        assert_eq!(result, (vec![1.0, 2.0], vec![0.5], vec![0.25, 0.75], 7));
    }
}

#[test]
fn hub_relays_from_non_zero_root() {
    let results = on_each_tcp_rank(3, |group| {
        let rank = group.rank();

        let mut values = vec![tensor(&[rank as f32; 3]), tensor(&[-(rank as f32)])];
        group.broadcast(&mut values, 2).unwrap();

        let obj = group.broadcast_object(vec![rank as u8; rank + 1], 1).unwrap();
        (values, obj)
    });

    for (values, obj) in results {
        assert_eq!(values, vec![tensor(&[2.0; 3]), tensor(&[-2.0])]);
        assert_eq!(obj, vec![1, 1]);
    }
}

#[test]
fn peer_with_wrong_group_size_is_refused() {
    let hub = TcpGroup::bind(loopback(), NonZeroUsize::new(2).unwrap()).unwrap();
    let addr = hub.local_addr().unwrap();

    thread::scope(|s| {
        let accepted = s.spawn(move || hub.accept());

        let refused = TcpGroup::join(&config(1, 3, addr));
        assert!(matches!(refused, Err(StateErr::Collective(_))));

        let joined = TcpGroup::join(&config(1, 2, addr)).unwrap();
        assert_eq!(joined.size(), 2);

        let hub = accepted.join().unwrap().unwrap();
        assert_eq!(hub.rank(), 0);
    });
}

#[test]
fn hub_rank_cannot_join() {
    let res = TcpGroup::join(&config(0, 2, loopback()));
    assert!(matches!(res, Err(StateErr::Collective(_))));
}
