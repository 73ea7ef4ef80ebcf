// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Declarative [`Entity`](crate::schema::Entity) implementations.

/// Implement [`Entity`](crate::schema::Entity) for a plain struct.
///
/// Fields are listed in column order. `policy`, `outbox` and `validate`
/// are optional and must appear in that order when present.
///
/// ```
/// use entity_persistence::entity;
/// use entity_persistence::schema::{Entity, WritePolicy};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// struct User {
///     id: i64,
///     email: String,
///     display_name: Option<String>,
/// }
///
/// fn check_user(user: &User) -> Result<(), String> {
///     if user.email.contains('@') {
///         Ok(())
///     } else {
///         Err(format!("bad email {}", user.email))
///     }
/// }
///
/// entity!(User => "users" {
///     key: [id],
///     fields: [id, email, display_name],
///     policy: Upsert,
///     outbox: true,
///     validate: check_user,
/// });
///
/// let meta = User::metadata();
/// assert_eq!(meta.table(), "users");
/// assert_eq!(meta.default_policy(), WritePolicy::Upsert);
/// assert!(meta.emits_outbox());
/// assert_eq!(meta.key_of(&User { id: 7, ..Default::default() }), "7");
/// assert!(User::default().validate().is_err());
/// ```
#[macro_export]
macro_rules! entity {
    (
        $ty:ty => $table:literal {
            key: [$($key:ident),+ $(,)?],
            fields: [$($field:ident),+ $(,)?]
            $(, policy: $policy:ident)?
            $(, outbox: $outbox:literal)?
            $(, validate: $validate:path)?
            $(,)?
        }
    ) => {
        impl $crate::schema::Entity for $ty {
            fn describe() -> ::std::result::Result<
                $crate::schema::EntityMetadata<Self>,
                $crate::schema::MetadataError,
            > {
                $crate::schema::EntityMetadata::<Self>::builder($table)
                    $(.field(
                        ::std::stringify!($field),
                        |e: &$ty| &e.$field,
                        |e: &mut $ty| &mut e.$field,
                    ))+
                    .key(&[$(::std::stringify!($key)),+])
                    $(.policy($crate::schema::WritePolicy::$policy))?
                    $(.outbox($outbox))?
                    .build()
            }

            fn metadata() -> &'static $crate::schema::EntityMetadata<Self> {
                static METADATA: ::std::sync::OnceLock<$crate::schema::EntityMetadata<$ty>> =
                    ::std::sync::OnceLock::new();
                METADATA.get_or_init(|| match <Self as $crate::schema::Entity>::describe() {
                    ::std::result::Result::Ok(meta) => meta,
                    ::std::result::Result::Err(e) => ::std::panic!(
                        "entity {} is misconfigured: {}",
                        ::std::stringify!($ty),
                        e
                    ),
                })
            }

            $(
                fn validate(&self) -> ::std::result::Result<(), ::std::string::String> {
                    $validate(self)
                }
            )?
        }
    };
}
