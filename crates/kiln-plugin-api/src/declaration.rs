//! The symbol a compiled plugin exports for the host to bind to

use crate::plugin::Plugin;

/// Version of the plugin contract
///
/// Bumped whenever a change to this crate alters the layout or behavior the
/// host relies on. The host refuses modules declaring a different version.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Version string of the compiler this crate was built with
///
/// Trait objects have no stable layout across compilers, so the host and the
/// plugin must agree on this exactly.
pub const RUSTC_VERSION: &str = env!("KILN_RUSTC_VERSION");

/// Name of the exported static every plugin module carries
pub const ENTRY_SYMBOL: &str = "kiln_plugin_declaration";

/// Constructor producing a fresh plugin instance
pub type PluginConstructor = fn() -> Option<Box<dyn Plugin>>;

/// Declaration exported by [`export_plugin!`](crate::export_plugin)
///
/// The version fields come first so the host can read them before trusting
/// the rest of the structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginDeclaration {
    /// Contract version the module was built against
    pub api_version: u32,

    /// Compiler the module was built with
    pub rustc_version: &'static str,

    /// Instance constructor
    pub constructor: PluginConstructor,
}

impl PluginDeclaration {
    /// Whether the declaration matches this build of the contract
    pub fn is_compatible(&self) -> bool {
        self.api_version == PLUGIN_API_VERSION && self.rustc_version == RUSTC_VERSION
    }
}

/// Export a plugin constructor from a `cdylib`
///
/// The argument is any expression callable with no arguments that returns a
/// value implementing [`Plugin`](crate::Plugin).
///
/// ```rust,ignore
/// use kiln_plugin_api::prelude::*;
///
/// #[derive(Debug, Default)]
/// struct HelloWorld;
///
/// impl Plugin for HelloWorld {
///     // ...
/// }
///
/// export_plugin!(HelloWorld::default);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($constructor:expr) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static kiln_plugin_declaration: $crate::PluginDeclaration =
            $crate::PluginDeclaration {
                api_version: $crate::PLUGIN_API_VERSION,
                rustc_version: $crate::RUSTC_VERSION,
                constructor: {
                    fn __kiln_construct(
                    ) -> ::std::option::Option<::std::boxed::Box<dyn $crate::Plugin>> {
                        let plugin = ($constructor)();
                        ::std::option::Option::Some(::std::boxed::Box::new(plugin))
                    }
                    __kiln_construct
                },
            };
    };
}
