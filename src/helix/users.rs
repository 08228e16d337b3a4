use log::debug;

use super::{HelixApi, User};
use crate::cache::{LookupCache, build_key};
use crate::error::Result;

/// Resolve logins to user records, through the lookup cache
///
/// Usernames that do not exist are simply absent from the result; an
/// all-empty answer is not cached so a channel created later still resolves.
pub async fn get_users_by_username(
    client: &dyn HelixApi,
    cache: &LookupCache,
    usernames: &[String],
) -> Result<Vec<User>> {
    let key = build_key("channel", "username", usernames);
    debug!("Checking cache for users, key {}", key);

    cache
        .get_or_fetch(&key, || async {
            client
                .get_users(usernames)
                .await?
                .into_data("get users by username")
        })
        .await
}
