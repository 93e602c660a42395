//! Naming resolver tests.

use std::sync::atomic::Ordering;

use crate::glue::{DirStore, EntryKind};
use crate::name::{NameState, PathType};
use crate::status::Status;
use crate::testkit::{fixture, local_uid, Fix};
use crate::uid::{Uid, UID_NIL};

const NET_ROOT: Uid = Uid::new(0x10, 1);
const NODE_ROOT: Uid = Uid::new(0x20, 2);
const NODE_DATA: Uid = Uid::new(0x30, 3);
const COM: Uid = Uid::new(0x40, 4);

fn seed_tree(fix: &Fix) {
    let k = &fix.k;
    k.name
        .set_well_known(NET_ROOT, NODE_ROOT, NODE_DATA, COM, NODE_ROOT);
    fix.dirs.add_directory(NET_ROOT);
    fix.dirs.add_directory(NODE_ROOT);
    fix.dirs.add_directory(NODE_DATA);
    fix.dirs.add_directory(COM);
    fix.dirs
        .add(NODE_ROOT, "com", COM, EntryKind::Directory)
        .unwrap();
}

#[test]
fn validate_classifies_paths() {
    assert_eq!(NameState::validate("a/b"), (PathType::Relative, 0));
    assert_eq!(NameState::validate(""), (PathType::Relative, 0));
    assert_eq!(NameState::validate("/a"), (PathType::Absolute, 1));
    assert_eq!(NameState::validate("//n/a"), (PathType::Network, 2));
    assert_eq!(
        NameState::validate("`node_data"),
        (PathType::NodeData, 10)
    );
    assert_eq!(
        NameState::validate("`node_data/foo"),
        (PathType::NodeData, 11)
    );
    assert_eq!(NameState::validate("`other"), (PathType::Error, 0));
    let long = "x".repeat(300);
    assert_eq!(NameState::validate(&long), (PathType::Error, 0));
}

#[test]
fn split_path_keeps_root_prefixes() {
    assert_eq!(NameState::split_path("/a/b"), ("/a", "b"));
    assert_eq!(NameState::split_path("/a"), ("/", "a"));
    assert_eq!(NameState::split_path("//n"), ("//", "n"));
    assert_eq!(NameState::split_path("a/b/c"), ("a/b", "c"));
    assert_eq!(NameState::split_path("plain"), ("", "plain"));
}

#[test]
fn nameq_ignores_trailing_spaces() {
    assert!(NameState::nameq("alpha", "alpha"));
    assert!(NameState::nameq("alpha  ", "alpha"));
    assert!(NameState::nameq("alpha", "alpha "));
    assert!(!NameState::nameq("alpha", "alphb"));
    assert!(!NameState::nameq("", "alpha"));
    assert!(!NameState::nameq("alp ha", "alpha"));
}

#[test]
fn resolve_well_known_roots() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    assert_eq!(k.name.resolve(k, "/").unwrap(), NODE_ROOT);
    assert_eq!(k.name.resolve(k, "//").unwrap(), NET_ROOT);
    assert_eq!(k.name.resolve(k, "`node_data").unwrap(), NODE_DATA);
    assert_eq!(k.name.resolve(k, "/com").unwrap(), COM);
}

#[test]
fn resolve_traverses_and_skips_dot() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    let file = local_uid(50);
    fix.dirs.add(COM, "bar", file, EntryKind::File).unwrap();
    assert_eq!(k.name.resolve(k, "/com/bar").unwrap(), file);
    assert_eq!(k.name.resolve(k, "/com/./bar").unwrap(), file);
    assert_eq!(k.name.resolve(k, "/com//bar").unwrap(), file);
}

#[test]
fn dot_dot_is_rejected() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    assert_eq!(
        k.name.resolve(k, "/com/bar/../baz").unwrap_err(),
        Status::NamingInvalidPathname
    );
}

#[test]
fn resolve_from_node_data() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    let foo = local_uid(51);
    fix.dirs
        .add(NODE_DATA, "foo", foo, EntryKind::File)
        .unwrap();
    assert_eq!(k.name.resolve(k, "`node_data/foo").unwrap(), foo);
}

#[test]
fn missing_names_and_non_directories() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    assert_eq!(
        k.name.resolve(k, "/nope").unwrap_err(),
        Status::NamingNameNotFound
    );
    let file = local_uid(52);
    fix.dirs.add(COM, "plain", file, EntryKind::File).unwrap();
    assert_eq!(
        k.name.resolve(k, "/com/plain/deeper").unwrap_err(),
        Status::NamingNotADirectory
    );
}

#[test]
fn links_traverse_bounded() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    let file = local_uid(53);
    fix.dirs.add(COM, "real", file, EntryKind::File).unwrap();
    fix.dirs
        .add(
            NODE_ROOT,
            "shortcut",
            UID_NIL,
            EntryKind::Link("/com/real".into()),
        )
        .unwrap();
    assert_eq!(k.name.resolve(k, "/shortcut").unwrap(), file);

    fix.dirs
        .add(NODE_ROOT, "loop", UID_NIL, EntryKind::Link("/loop".into()))
        .unwrap();
    assert_eq!(
        k.name.resolve(k, "/loop").unwrap_err(),
        Status::NamingInvalidPathname
    );
}

#[test]
fn relative_paths_use_working_directory() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    fix.procs.set_asid(1);
    k.name.set_wdir_uid(k, COM).unwrap();
    assert_eq!(k.name.get_wdir(1), COM);
    let file = local_uid(54);
    fix.dirs.add(COM, "rel", file, EntryKind::File).unwrap();
    assert_eq!(k.name.resolve(k, "rel").unwrap(), file);
}

#[test]
fn set_wdir_by_path_and_rejection_of_files() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    fix.procs.set_asid(1);
    k.name.set_wdir(k, "/com").unwrap();
    assert_eq!(k.name.get_wdir(1), COM);
    let file = local_uid(55);
    fix.dirs.add(COM, "f", file, EntryKind::File).unwrap();
    assert_eq!(
        k.name.set_wdir(k, "/com/f").unwrap_err(),
        Status::NamingNotADirectory
    );
    k.name.set_ndir(k, "/").unwrap();
    assert_eq!(k.name.get_ndir(1), NODE_ROOT);
}

#[test]
fn cr_file_creates_and_cleans_up_on_failure() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    let uid = k.name.cr_file(k, "/com/newfile").unwrap();
    assert!(!uid.is_nil());
    assert_eq!(k.name.resolve(k, "/com/newfile").unwrap(), uid);
    assert!(fix.acl.copies.load(Ordering::Relaxed) >= 1);

    // A colliding leaf fails after creation and deletes the new object.
    assert_eq!(
        k.name.cr_file(k, "/com/newfile").unwrap_err(),
        Status::NamingAlreadyExists
    );
}

#[test]
fn drop_verifies_the_uid() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    let uid = k.name.cr_file(k, "/com/victim").unwrap();
    assert_eq!(
        k.name.drop(k, "/com/victim", local_uid(99)).unwrap_err(),
        Status::NamingNameNotFound
    );
    k.name.drop(k, "/com/victim", uid).unwrap();
    assert_eq!(
        k.name.resolve(k, "/com/victim").unwrap_err(),
        Status::NamingNameNotFound
    );
}

#[test]
fn asid_lifecycle_clones_and_frees() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    fix.procs.set_asid(1);
    k.name.set_wdir_uid(k, COM).unwrap();
    k.name.init_asid(k, 5).unwrap();
    assert_eq!(k.name.get_wdir(5), COM);
    k.name.fork(k, 5, 6).unwrap();
    assert_eq!(k.name.get_wdir(6), COM);
    k.name.free_asid(k, 6);
    assert!(k.name.get_wdir(6).is_nil());
}

#[test]
fn remote_directories_resolve_through_server() {
    let fix = fixture();
    let k = &fix.k;
    seed_tree(&fix);
    // A directory homed on node 9, entered under the local root.
    let remote_dir = Uid::new(0x900, 9 << 12);
    fix.dirs
        .add(NODE_ROOT, "away", remote_dir, EntryKind::Directory)
        .unwrap();
    // Note: not registered as a local directory, so lookups inside it
    // go over the wire.
    let target = Uid::new(0x901, (9 << 12) | 1);
    fix.net.stage_name(remote_dir, "thing", 2, target);
    fix.net.set_server(9);
    assert_eq!(k.name.resolve(k, "/away/thing").unwrap(), target);
}

#[test]
fn boot_from_vtoc_sets_roots() {
    let fix = fixture();
    let k = &fix.k;
    fix.vtoc.set_name_dirs(0, NODE_ROOT, NODE_DATA);
    k.name.boot_from_vtoc(k, 0).unwrap();
    fix.dirs.add_directory(NODE_ROOT);
    assert_eq!(k.name.resolve(k, "/").unwrap(), NODE_ROOT);
    assert_eq!(k.name.resolve(k, "`node_data").unwrap(), NODE_DATA);
}
