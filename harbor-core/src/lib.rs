pub mod codec;
pub mod component;
pub mod config;
pub mod ffi;
pub mod manager;
pub mod mq;
pub mod object;
pub mod packet;
pub mod poller;
pub mod service;
pub mod session;
pub mod timer;
pub mod variant;

mod error;
pub use error::{set_last_error, take_last_error, AnyError, AnyResult, CoreResult, Error, Kind};

pub use codec::{CodecChain, CodecLayer, DecodeOutcome, FrameCodec, LayerRegistry};
pub use component::{Component, ComponentMethods, ComponentRegistry, HandlerOutcome, Method};
pub use config::{AppConfig, LogLevel, ManagerConfig, ServiceConfig};
pub use manager::{ServiceManager, ServiceStopResults};
pub use mq::{Envelope, MessageQueue, MessageSender, ServiceId};
pub use object::{pool::AutoReleasePool, NoActivePool, Retained};
pub use packet::{Packet, PacketFlags};
pub use poller::{CloseReason, Poller, SocketEvent};
pub use service::{
    DispatchOutcome, FilterAction, Service, ServiceBuilder, ServiceContext, ServiceHandle,
    ServiceState,
};
pub use session::{Session, SessionState};
pub use timer::{TimerContext, TimerFire, TimerId, TimerWheel};
pub use variant::Variant;

use figlet_rs::FIGfont;

pub fn print_logo() {
    let standard_font = FIGfont::standard().unwrap();
    if let Some(figure) = standard_font.convert("Harbor") {
        println!("{}", figure);
    }
}
