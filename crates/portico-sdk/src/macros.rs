//! Declarative macros for plugin registration.

/// Declare a plugin class together with the interfaces it provides.
///
/// Expands to an implementation of
/// [`PluginRegistration`](crate::PluginRegistration) that builds the
/// class's descriptor, plus an exported marker symbol through which a
/// loader can recognize the library a statically registered plugin came
/// from.
///
/// Every listed interface must be a trait the plugin class implements; a
/// mismatch is rejected at compile time. The class itself must be
/// `Default + Send + Sync`.
#[macro_export]
macro_rules! portico_plugin {
    (
        plugin: $plugin:ty,
        interfaces: [$($iface:path),* $(,)?] $(,)?
    ) => {
        $crate::portico_plugin! {
            plugin: $plugin,
            interfaces: [$($iface),*],
            aliases: [],
        }
    };
    (
        plugin: $plugin:ty,
        interfaces: [$($iface:path),* $(,)?],
        aliases: [$($alias:expr),* $(,)?] $(,)?
    ) => {
        const _: () = {
            #[export_name = concat!("portico_marker_", stringify!($plugin))]
            static MARKER: u8 = 0;
        };

        impl $crate::PluginRegistration for $plugin {
            fn descriptor() -> $crate::PluginDescriptor {
                let _ = $crate::core::descriptor::assert_plugin_bounds::<$plugin>;

                let mut info = $crate::PluginDescriptor::new(
                    $crate::core::utility::symbol_of::<$plugin>(),
                );
                info.marker_symbol = ::std::option::Option::Some(
                    ::std::string::String::from(
                        concat!("portico_marker_", stringify!($plugin)),
                    ),
                );

                $(
                    {
                        fn cast(ptr: *mut ()) -> *mut dyn $iface {
                            // Fails to compile when the plugin class does
                            // not implement the interface.
                            ptr.cast::<$plugin>() as *mut dyn $iface
                        }
                        info.add_interface::<dyn $iface>(cast);
                    }
                )*

                $(
                    info.aliases.insert(::std::string::String::from($alias));
                )*

                fn factory() -> *mut () {
                    ::std::boxed::Box::into_raw(::std::boxed::Box::new(
                        <$plugin as ::std::default::Default>::default(),
                    ))
                    .cast()
                }
                unsafe fn deleter(ptr: *mut ()) {
                    drop(::std::boxed::Box::from_raw(ptr.cast::<$plugin>()));
                }
                info.factory = ::std::option::Option::Some(factory);
                info.deleter =
                    ::std::option::Option::Some(deleter as unsafe fn(*mut ()));

                info
            }
        }
    };
}

/// Export the registration entry pair of a plugin library.
///
/// Invoke once per `cdylib` crate, listing every plugin class declared with
/// [`portico_plugin!`]. The generated `portico_plugin_hook_v2` entry
/// registers each class through the host's function table and retains the
/// returned tickets; the `portico_plugin_exit_v2` entry passes them back to
/// the host's cleanup hook while the library is being unloaded.
#[macro_export]
macro_rules! portico_export {
    ($($plugin:ty),+ $(,)?) => {
        #[doc(hidden)]
        mod __portico_export {
            pub static TICKETS: ::std::sync::Mutex<
                ::std::vec::Vec<$crate::RegistrationTicket>,
            > = ::std::sync::Mutex::new(::std::vec::Vec::new());

            pub static CLEANUP: ::std::sync::OnceLock<$crate::core::abi::CleanupFn> =
                ::std::sync::OnceLock::new();
        }

        #[no_mangle]
        pub unsafe extern "C" fn portico_plugin_hook_v2(host: *const $crate::HostVTable) {
            let host = match host.as_ref() {
                ::std::option::Option::Some(host)
                    if host.api_version == $crate::HOOK_API_VERSION =>
                {
                    host
                }
                _ => return,
            };

            let _ = __portico_export::CLEANUP.set(host.cleanup);
            let mut tickets = match __portico_export::TICKETS.lock() {
                ::std::result::Result::Ok(tickets) => tickets,
                ::std::result::Result::Err(poisoned) => poisoned.into_inner(),
            };

            $(
                if let ::std::option::Option::Some(ticket) = (host.register)(
                    <$plugin as $crate::PluginRegistration>::descriptor(),
                    ::std::mem::size_of::<$crate::PluginDescriptor>(),
                    ::std::mem::align_of::<$crate::PluginDescriptor>(),
                ) {
                    tickets.push(ticket);
                }
            )+
        }

        #[no_mangle]
        pub unsafe extern "C" fn portico_plugin_exit_v2() {
            let mut tickets = match __portico_export::TICKETS.lock() {
                ::std::result::Result::Ok(tickets) => tickets,
                ::std::result::Result::Err(poisoned) => poisoned.into_inner(),
            };
            match __portico_export::CLEANUP.get() {
                ::std::option::Option::Some(cleanup) => {
                    for ticket in tickets.drain(..) {
                        cleanup(ticket);
                    }
                }
                ::std::option::Option::None => tickets.clear(),
            }
        }
    };
}
