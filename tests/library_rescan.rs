use rust_folder_frame::library::{ImageLibrary, RescanOutcome};
use std::fs;
use std::thread;
use tempfile::tempdir;

fn extensions(list: &[&str]) -> Vec<String> {
    list.iter().map(|e| e.to_string()).collect()
}

#[test]
fn mixed_case_extensions_sorted_lexicographically() {
    let tmp = tempdir().unwrap();
    for name in ["b.PNG", "a.jpg", "c.txt", "D.Jpeg", "e.bmp.bak"] {
        fs::write(tmp.path().join(name), b"x").unwrap();
    }
    let library = ImageLibrary::new(
        tmp.path(),
        &extensions(&["png", "jpg", "jpeg", "bmp", "gif", "webp"]),
    );
    library.rescan().unwrap();
    // Byte order: uppercase sorts before lowercase.
    assert_eq!(library.current_snapshot().names(), ["D.Jpeg", "a.jpg", "b.PNG"]);
}

#[test]
fn configured_extensions_restrict_the_list() {
    let tmp = tempdir().unwrap();
    for name in ["a.jpg", "b.png"] {
        fs::write(tmp.path().join(name), b"x").unwrap();
    }
    let library = ImageLibrary::new(tmp.path(), &extensions(&["PNG"]));
    library.rescan().unwrap();
    assert_eq!(library.current_snapshot().names(), ["b.png"]);
}

#[test]
fn idempotent_rescan() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("a.jpg"), b"x").unwrap();
    let library = ImageLibrary::new(tmp.path(), &extensions(&["jpg"]));

    assert_eq!(library.rescan().unwrap(), RescanOutcome::Changed { len: 1 });
    assert!(library.take_updated());
    let before = library.current_snapshot();
    for _ in 0..3 {
        assert_eq!(library.rescan().unwrap(), RescanOutcome::Unchanged);
    }
    assert!(!library.take_updated());
    assert_eq!(*before, *library.current_snapshot());
}

#[test]
fn file_in_place_of_folder_keeps_previous_snapshot() {
    let tmp = tempdir().unwrap();
    let folder = tmp.path().join("images");
    fs::create_dir(&folder).unwrap();
    fs::write(folder.join("a.jpg"), b"x").unwrap();
    let library = ImageLibrary::new(&folder, &extensions(&["jpg"]));
    library.rescan().unwrap();

    fs::remove_dir_all(&folder).unwrap();
    fs::write(&folder, b"not a folder").unwrap();
    assert!(library.rescan().is_err());
    assert_eq!(library.current_snapshot().names(), ["a.jpg"]);
}

#[test]
fn concurrent_readers_only_see_complete_lists() {
    let tmp = tempdir().unwrap();
    for i in 0..50 {
        fs::write(tmp.path().join(format!("{i:03}.png")), b"x").unwrap();
    }
    let library = ImageLibrary::new(tmp.path(), &extensions(&["png"]));
    library.rescan().unwrap();

    let writer = {
        let library = library.clone();
        let folder = tmp.path().to_path_buf();
        thread::spawn(move || {
            for i in 50..100 {
                fs::write(folder.join(format!("{i:03}.png")), b"x").unwrap();
                library.rescan().unwrap();
            }
        })
    };

    for _ in 0..200 {
        let snapshot = library.current_snapshot();
        let names = snapshot.names();
        assert!(names.len() >= 50);
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        // Every published list is a prefix of the final one: no gaps.
        assert_eq!(names.last().unwrap(), &format!("{:03}.png", names.len() - 1));
    }
    writer.join().unwrap();
    assert_eq!(library.current_snapshot().len(), 100);
}
